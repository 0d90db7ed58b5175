use std::io::{self, Write};

use clap::{CommandFactory, Parser};
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;

use chat_relay::cli::Args;
use chat_relay::client::{ChatClient, ClientError};
use chat_relay::config::Config;
use chat_relay::decoder::Renderer;
use chat_relay::server;
use chat_relay::token_source::StaticToken;

/// Prints only the part of the accumulated text not yet on screen.
#[derive(Default)]
struct TerminalRenderer {
    shown: usize,
}

impl Renderer for TerminalRenderer {
    fn render(&mut self, text: &str) {
        if let Some(fresh) = text.get(self.shown..) {
            print!("{fresh}");
            let _ = io::stdout().flush();
        }
        self.shown = text.len();
    }
}

async fn ask(client: &mut ChatClient, tokens: &StaticToken, prompt: &str) {
    let mut renderer = TerminalRenderer::default();
    match client.send_turn(prompt, tokens, &mut renderer).await {
        Ok(Some(_)) => println!(),
        Ok(None) => {}
        Err(ClientError::Aborted { .. }) => {
            println!();
            eprintln!("{}", chat_relay::error::ABORTED_MESSAGE.red());
        }
        Err(e) => eprintln!("{}", e.to_string().red()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_relay=info".into()),
        )
        .init();

    let args = Args::parse();

    if let Some(shell) = args.completions {
        clap_complete::generate(shell, &mut Args::command(), "chat-relay", &mut io::stdout());
        return Ok(());
    }

    if args.serve {
        let mut config = Config::load(args.config.as_deref())?;
        args.apply_to(&mut config);
        server::serve(config).await?;
        return Ok(());
    }

    let mut client = ChatClient::new(reqwest::Client::new(), args.url.clone());
    let tokens = StaticToken(args.token.clone());

    if let Some(prompt) = &args.prompt {
        ask(&mut client, &tokens, prompt).await;
        return Ok(());
    }

    eprintln!("{}", chat_relay::client::WELCOME_MESSAGE.bright_cyan());
    eprintln!("{}", "  Ctrl+D to quit.".bright_blue());
    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    while let Some(line) = lines.next().await {
        ask(&mut client, &tokens, &line?).await;
    }

    Ok(())
}
