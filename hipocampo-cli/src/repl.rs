//! Interactive terminal session over `App` and `AudioRecorder`.

use std::io::Write;

use anyhow::Result;
use hipocampo_core::models::{MessageKind, Sender};
use hipocampo_core::phone::{clean_phone, format_phone};
use hipocampo_core::{AgentApi, App, AudioRecorder, ChatSession, Screen, SendOutcome};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::task::JoinHandle;

use crate::render::{render_message, render_meter};

const HELP: &str = "\
Comandos:
  /gravar            começar a gravar um áudio
  /parar             finalizar a gravação
  /ouvir             ouvir a gravação
  /pausar            pausar a reprodução
  /enviar [legenda]  enviar a gravação
  /cancelar          descartar a gravação
  /limpar            limpar a conversa
  /sair              encerrar a sessão
  /ajuda             mostrar esta ajuda
  /quit              fechar o programa
Qualquer outro texto é enviado como mensagem.";

enum Flow {
    Continue,
    Quit,
}

pub struct Repl<'a, A: AgentApi + ?Sized> {
    app: &'a mut App<A>,
    recorder: AudioRecorder,
    input: Lines<BufReader<Stdin>>,
    /// Transcript entries already printed.
    shown: usize,
    last_screen: Option<Screen>,
    meter: Option<JoinHandle<()>>,
}

impl<'a, A: AgentApi + ?Sized> Repl<'a, A> {
    pub fn new(app: &'a mut App<A>, recorder: AudioRecorder) -> Self {
        Self {
            app,
            recorder,
            input: BufReader::new(tokio::io::stdin()).lines(),
            shown: 0,
            last_screen: None,
            meter: None,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        println!("Hipocampo, seu assistente de memória. Digite /ajuda para ver os comandos.");
        loop {
            let screen = self.app.screen();
            if self.last_screen != Some(screen) {
                self.enter(screen);
            }
            let flow = match screen {
                Screen::Login => self.login_screen().await?,
                Screen::Register => self.register_screen().await?,
                Screen::Chat => self.chat_screen().await?,
            };
            if let Flow::Quit = flow {
                break;
            }
        }
        self.stop_meter();
        self.recorder.cancel_recording().await;
        Ok(())
    }

    fn enter(&mut self, screen: Screen) {
        self.last_screen = Some(screen);
        match screen {
            Screen::Login => println!("\n== Entrar =="),
            Screen::Register => println!("\n== Criar conta =="),
            Screen::Chat => {
                self.shown = 0;
                if let Some(greeting) = self.app.greeting() {
                    println!("\n{greeting}");
                    println!("Como posso ajudar você hoje? Digite sua mensagem ou /gravar.");
                }
            }
        }
    }

    async fn login_screen(&mut self) -> Result<Flow> {
        let Some(line) = self.prompt("Telefone (/criar para nova conta): ").await? else {
            return Ok(Flow::Quit);
        };
        match line.trim() {
            "/quit" => return Ok(Flow::Quit),
            "/criar" => {
                self.app.show_register();
                return Ok(Flow::Continue);
            }
            _ => {}
        }
        echo_phone(&line);
        if let Err(e) = self.app.login(&line).await {
            println!("✗ {e}");
        }
        Ok(Flow::Continue)
    }

    async fn register_screen(&mut self) -> Result<Flow> {
        let Some(name) = self.prompt("Nome completo (/entrar para voltar): ").await? else {
            return Ok(Flow::Quit);
        };
        match name.trim() {
            "/quit" => return Ok(Flow::Quit),
            "/entrar" => {
                self.app.show_login();
                return Ok(Flow::Continue);
            }
            _ => {}
        }
        let Some(phone) = self.prompt("Telefone: ").await? else {
            return Ok(Flow::Quit);
        };
        echo_phone(&phone);
        if let Err(e) = self.app.register(name.trim(), &phone).await {
            println!("✗ {e}");
        }
        Ok(Flow::Continue)
    }

    async fn chat_screen(&mut self) -> Result<Flow> {
        let Some(line) = self.prompt("> ").await? else {
            return Ok(Flow::Quit);
        };
        let line = line.trim();
        if let Some(command) = line.strip_prefix('/') {
            let (name, arg) = command.split_once(' ').unwrap_or((command, ""));
            return Ok(self.command(name, arg.trim()).await);
        }

        let Some(chat) = self.app.chat() else {
            return Ok(Flow::Continue);
        };
        typing(true);
        let outcome = chat.send_text(line).await;
        typing(false);
        print_new(chat, &mut self.shown, &outcome);
        Ok(Flow::Continue)
    }

    async fn command(&mut self, name: &str, arg: &str) -> Flow {
        match name {
            "gravar" => match self.recorder.start_recording().await {
                Ok(()) => {
                    println!("Gravando... /parar para finalizar, /cancelar para descartar.");
                    self.start_meter();
                }
                Err(e) => println!("✗ Não foi possível acessar o microfone: {e}"),
            },
            "parar" => {
                self.stop_meter();
                match self.recorder.stop_recording().await {
                    Ok(()) => println!(
                        "Gravação pronta ({}s). /ouvir, /enviar [legenda] ou /cancelar.",
                        self.recorder.duration_seconds()
                    ),
                    Err(e) => println!("✗ {e}"),
                }
            }
            "ouvir" => {
                if let Err(e) = self.recorder.play() {
                    println!("✗ {e}");
                }
            }
            "pausar" => self.recorder.pause(),
            "enviar" => {
                let Some(chat) = self.app.chat() else {
                    return Flow::Continue;
                };
                typing(true);
                let sent = self.recorder.send(chat, arg).await;
                typing(false);
                match sent {
                    Ok(outcome) => print_new(chat, &mut self.shown, &outcome),
                    Err(e) => println!("✗ {e}"),
                }
            }
            "cancelar" => {
                self.stop_meter();
                self.recorder.cancel_recording().await;
                println!("Gravação descartada.");
            }
            "limpar" => {
                if let Some(chat) = self.app.chat() {
                    chat.clear();
                }
                self.shown = 0;
                println!("Conversa limpa.");
            }
            "sair" => {
                self.stop_meter();
                self.recorder.cancel_recording().await;
                self.app.logout();
                println!("Sessão encerrada.");
            }
            "ajuda" => println!("{HELP}"),
            "quit" => return Flow::Quit,
            other => println!("Comando desconhecido: /{other}. Digite /ajuda."),
        }
        Flow::Continue
    }

    async fn prompt(&mut self, label: &str) -> Result<Option<String>> {
        print!("{label}");
        std::io::stdout().flush()?;
        Ok(self.input.next_line().await?)
    }

    fn start_meter(&mut self) {
        self.stop_meter();
        let mut rx = self.recorder.subscribe();
        self.meter = Some(tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let line = {
                    let meter = rx.borrow_and_update();
                    render_meter(&meter.levels, meter.duration_secs)
                };
                let mut out = std::io::stdout().lock();
                let _ = write!(out, "\r\x1b[K{line}");
                let _ = out.flush();
            }
        }));
    }

    fn stop_meter(&mut self) {
        if let Some(task) = self.meter.take() {
            task.abort();
            clear_line();
        }
    }
}

fn echo_phone(input: &str) {
    if let Some(masked) = masked_echo(input) {
        println!("  {masked}");
    }
}

/// The masked number, or `None` when the input has no digits to show.
fn masked_echo(input: &str) -> Option<String> {
    if clean_phone(input).is_empty() {
        None
    } else {
        Some(format_phone(input))
    }
}

fn typing(on: bool) {
    if on {
        print!("Digitando...");
        let _ = std::io::stdout().flush();
    } else {
        clear_line();
    }
}

fn clear_line() {
    print!("\r\x1b[K");
    let _ = std::io::stdout().flush();
}

/// Print transcript entries added since the last call. The user's own text
/// is already on screen.
fn print_new<A: AgentApi + ?Sized>(
    chat: &ChatSession<A>,
    shown: &mut usize,
    outcome: &SendOutcome,
) {
    if let SendOutcome::Skipped(_) = outcome {
        return;
    }
    let messages = chat.messages();
    for message in messages.get(*shown..).unwrap_or(&[]) {
        if message.sender == Sender::User && message.kind == MessageKind::Text {
            continue;
        }
        println!("{}", render_message(message));
    }
    *shown = messages.len();
    if let Some(notice) = chat.error() {
        println!("✗ {notice}");
    }
}
