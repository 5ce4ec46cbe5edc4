//! Terminal rendering: transcript lines, agent markdown, the level meter.

use chrono::{DateTime, Local, TimeZone, Utc};
use hipocampo_core::models::{Message, MessageKind, Sender};
use pulldown_cmark::{Event, Options, Parser, Tag, TagEnd};

const METER_GLYPHS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

// ============================================================================
// Messages
// ============================================================================

/// Local wall-clock `HH:MM`.
pub fn format_time(ts: &DateTime<Utc>) -> String {
    format_time_in(ts, &Local)
}

fn format_time_in<Tz: TimeZone>(ts: &DateTime<Utc>, tz: &Tz) -> String
where
    Tz::Offset: std::fmt::Display,
{
    ts.with_timezone(tz).format("%H:%M").to_string()
}

/// One transcript entry. Agent text is rendered from markdown, user text
/// is shown as typed.
pub fn render_message(message: &Message) -> String {
    let time = format_time(&message.timestamp);
    let who = match message.sender {
        Sender::User => "Você",
        Sender::Agent => "Hipocampo",
    };
    let body = match (message.sender, message.kind) {
        (_, MessageKind::Audio) => {
            let url = message.audio_url.as_deref().unwrap_or("");
            if message.content.is_empty() {
                format!("🎤 Áudio ({url})")
            } else {
                format!("🎤 Áudio ({url})\n{}", message.content)
            }
        }
        (_, MessageKind::Error) => format!("⚠ {}", message.content),
        (Sender::Agent, MessageKind::Text) => render_markdown(&message.content),
        (Sender::User, MessageKind::Text) => message.content.clone(),
    };
    format!("[{time}] {who}: {}", indent_continuation(&body, "    "))
}

fn indent_continuation(text: &str, indent: &str) -> String {
    let mut lines = text.lines();
    let mut out = lines.next().unwrap_or("").to_string();
    for line in lines {
        out.push('\n');
        if !line.is_empty() {
            out.push_str(indent);
        }
        out.push_str(line);
    }
    out
}

// ============================================================================
// Meter
// ============================================================================

/// `▁▃█… 0:03` for the recording line.
pub fn render_meter(levels: &[f32], duration_secs: u64) -> String {
    let top = METER_GLYPHS.len() - 1;
    let bars: String = levels
        .iter()
        .map(|l| METER_GLYPHS[(l.clamp(0.0, 1.0) * top as f32).round() as usize])
        .collect();
    format!(
        "● {bars} {}:{:02}",
        duration_secs / 60,
        duration_secs % 60
    )
}

// ============================================================================
// Markdown
// ============================================================================

/// Flatten markdown into plain terminal text.
pub fn render_markdown(content: &str) -> String {
    let options =
        Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH | Options::ENABLE_TASKLISTS;
    let mut r = TextRenderer::default();
    for event in Parser::new_ext(content, options) {
        r.event(event);
    }
    r.out.trim_end().to_string()
}

#[derive(Default)]
struct TextRenderer {
    out: String,
    at_line_start: bool,
    quote_depth: usize,
    /// Next number for ordered lists, `None` for bullets.
    lists: Vec<Option<u64>>,
    in_code_block: bool,
    /// Destination and output offset of each open link.
    links: Vec<(String, usize)>,
    row: Vec<String>,
    cell: Option<String>,
}

impl TextRenderer {
    fn event(&mut self, event: Event<'_>) {
        match event {
            Event::Start(tag) => self.start(tag),
            Event::End(tag) => self.end(tag),
            Event::Text(text) => self.text(&text),
            Event::Code(code) => self.text(&format!("`{code}`")),
            Event::Html(html) | Event::InlineHtml(html) => self.text(&html),
            Event::SoftBreak => self.text(" "),
            Event::HardBreak => self.line_break(),
            Event::Rule => {
                self.line_break();
                self.write("────────");
                self.end_block();
            }
            Event::TaskListMarker(done) => self.write(if done { "[x] " } else { "[ ] " }),
            _ => {}
        }
    }

    fn start(&mut self, tag: Tag<'_>) {
        match tag {
            Tag::BlockQuote(_) => {
                self.line_break();
                self.quote_depth += 1;
            }
            Tag::CodeBlock(_) => {
                self.line_break();
                self.in_code_block = true;
            }
            Tag::List(first) => {
                self.line_break();
                self.lists.push(first);
            }
            Tag::Item => {
                self.line_break();
                let depth = self.lists.len().saturating_sub(1);
                let marker = match self.lists.last_mut() {
                    Some(Some(n)) => {
                        let marker = format!("{n}. ");
                        *n += 1;
                        marker
                    }
                    _ => "• ".to_string(),
                };
                self.write(&format!("{}{marker}", "  ".repeat(depth)));
            }
            Tag::Link { dest_url, .. } => {
                self.links.push((dest_url.to_string(), self.out.len()));
            }
            Tag::TableHead | Tag::TableRow => self.row.clear(),
            Tag::TableCell => self.cell = Some(String::new()),
            _ => {}
        }
    }

    fn end(&mut self, tag: TagEnd) {
        match tag {
            TagEnd::Paragraph | TagEnd::Heading(_) | TagEnd::Table => self.end_block(),
            TagEnd::BlockQuote(_) => {
                self.line_break();
                self.quote_depth = self.quote_depth.saturating_sub(1);
            }
            TagEnd::CodeBlock => {
                self.in_code_block = false;
                self.end_block();
            }
            TagEnd::List(_) => {
                self.lists.pop();
                if self.lists.is_empty() {
                    self.end_block();
                }
            }
            TagEnd::Item => self.line_break(),
            TagEnd::Link => {
                if let Some((dest, start)) = self.links.pop() {
                    let shown = self.out.get(start..).unwrap_or("");
                    if !dest.is_empty() && shown != dest {
                        self.text(&format!(" ({dest})"));
                    }
                }
            }
            TagEnd::TableCell => {
                if let Some(cell) = self.cell.take() {
                    self.row.push(cell.trim().to_string());
                }
            }
            TagEnd::TableHead | TagEnd::TableRow => {
                let row = self.row.join(" | ");
                self.row.clear();
                self.write(&row);
                self.line_break();
            }
            _ => {}
        }
    }

    fn text(&mut self, text: &str) {
        if let Some(cell) = self.cell.as_mut() {
            cell.push_str(text);
        } else if self.in_code_block {
            for line in text.lines() {
                self.write(&format!("    {line}"));
                self.line_break();
            }
        } else {
            self.write(text);
        }
    }

    fn write(&mut self, s: &str) {
        if s.is_empty() {
            return;
        }
        if self.out.is_empty() || self.at_line_start {
            self.out.push_str(&"│ ".repeat(self.quote_depth));
        }
        self.out.push_str(s);
        self.at_line_start = false;
    }

    fn line_break(&mut self) {
        if !self.out.is_empty() && !self.at_line_start {
            self.out.push('\n');
        }
        self.at_line_start = true;
    }

    fn end_block(&mut self) {
        self.line_break();
        if self.lists.is_empty() && !self.out.is_empty() && !self.out.ends_with("\n\n") {
            self.out.push('\n');
        }
    }
}
