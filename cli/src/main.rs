use std::io;

use clap::{Args, Parser, Subcommand};
use jsonwebtoken::{EncodingKey, Header};
use neffos::server::{AllowAll, JwtPolicy, Server, ServerBuilder, StaticToken, TOKEN_PARAM, router};
use neffos::{ConnectError, DEFAULT_NAMESPACE, Events, Lifecycle, Namespaces, SendError, SessionConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use url::Url;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("connect failed: {0}")]
    Connect(#[from] ConnectError),
    #[error("send failed: {0}")]
    Send(#[from] SendError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("token signing failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

#[derive(Parser, Debug)]
#[command(name = "neffos", about = "Namespaced websocket chat server and client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the chat namespace over websockets.
    Serve(ServeArgs),
    /// Join the chat namespace and relay stdin lines as chat events.
    Chat(ChatArgs),
    /// Mint an HS256 token accepted by `serve --secret`.
    Token(TokenArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long, env = "NEFFOS_ADDR", default_value = "127.0.0.1:8080")]
    addr: String,

    #[arg(long, env = "NEFFOS_PATH", default_value = "/echo")]
    path: String,

    #[arg(long, default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Accept only this exact token.
    #[arg(long, env = "NEFFOS_TOKEN", conflicts_with = "secret")]
    token: Option<String>,

    /// Accept HS256 JWTs signed with this secret.
    #[arg(long, env = "NEFFOS_JWT_SECRET")]
    secret: Option<String>,
}

#[derive(Args, Debug)]
struct ChatArgs {
    #[arg(long, env = "NEFFOS_URL", default_value = "ws://127.0.0.1:8080/echo")]
    url: String,

    /// Credential appended as the `token` query parameter.
    #[arg(long, env = "NEFFOS_TOKEN")]
    token: Option<String>,

    #[arg(long, default_value = DEFAULT_NAMESPACE)]
    namespace: String,
}

#[derive(Args, Debug)]
struct TokenArgs {
    #[arg(long, env = "NEFFOS_JWT_SECRET", default_value = "My Secret")]
    secret: String,

    /// `sub` claim; also becomes the connection id on the server.
    #[arg(long)]
    subject: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => run_serve(args).await,
        Command::Chat(args) => run_chat(args).await,
        Command::Token(args) => run_token(&args),
    }
}

// =============================================================================
// SERVE
// =============================================================================

fn server_events() -> Events {
    Events::new()
        .on_lifecycle(Lifecycle::NamespaceConnected, |ns, msg| {
            info!(conn_id = %ns, namespace = %msg.namespace, "connected to namespace");
            Ok(())
        })
        .on_lifecycle(Lifecycle::NamespaceDisconnect, |ns, msg| {
            info!(conn_id = %ns, namespace = %msg.namespace, "disconnected from namespace");
            Ok(())
        })
        .on("chat", |ns, msg| {
            info!(conn_id = %ns, body = %msg.body_text(), "chat");
            if let Some(server) = ns.conn().and_then(|conn| conn.server()) {
                server.broadcast(Some(ns.conn_id()), msg);
            }
            Ok(())
        })
}

fn with_policy(builder: ServerBuilder, args: &ServeArgs) -> ServerBuilder {
    match (&args.token, &args.secret) {
        (Some(token), _) => builder.policy(StaticToken::new(token.clone())),
        (None, Some(secret)) => builder.policy(JwtPolicy::hs256(secret.as_bytes())),
        (None, None) => builder.policy(AllowAll),
    }
}

async fn run_serve(args: ServeArgs) -> Result<(), CliError> {
    let namespaces = Namespaces::new().namespace(&args.namespace, server_events());
    let builder = Server::builder(namespaces)
        .config(SessionConfig::from_env())
        .id_generator(|handshake| handshake.identity.subject.clone().unwrap_or_default())
        .on_disconnect(|conn| info!(conn_id = %conn, "client left"));
    let server = with_policy(builder, &args).build();

    let listener = tokio::net::TcpListener::bind(&args.addr).await?;
    info!(
        addr = %args.addr,
        path = %args.path,
        namespace = %args.namespace,
        "neffos listening"
    );

    axum::serve(listener, router(server.clone(), &args.path))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    server.close_all().await;
    Ok(())
}

// =============================================================================
// CHAT
// =============================================================================

fn dial_url(url: &str, token: Option<&str>) -> Result<String, CliError> {
    let mut parsed = Url::parse(url)?;
    if let Some(token) = token {
        parsed.query_pairs_mut().append_pair(TOKEN_PARAM, token);
    }
    Ok(parsed.into())
}

async fn run_chat(args: ChatArgs) -> Result<(), CliError> {
    let events = Events::new().on("chat", |_, msg| {
        if msg.is_error {
            println!("error: {}", msg.body_text());
        } else {
            println!("{}", msg.body_text());
        }
        Ok(())
    });
    let namespaces = Namespaces::new().namespace(&args.namespace, events);
    let url = dial_url(&args.url, args.token.as_deref())?;

    let conn = neffos::dial(&url, namespaces, SessionConfig::from_env()).await?;
    let ns = conn.connect(&args.namespace).await?;
    info!(conn_id = %conn, namespace = %args.namespace, "joined; type messages, `exit` to quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            () = conn.closed() => {
                warn!("server closed the connection");
                return Ok(());
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line == "exit" {
                    break;
                }
                if line.is_empty() {
                    continue;
                }
                match ns.emit("chat", line) {
                    Ok(()) => {}
                    Err(SendError::Backpressure) => warn!("write queue full, message dropped"),
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    ns.disconnect().await?;
    conn.close().await;
    Ok(())
}

// =============================================================================
// TOKEN
// =============================================================================

fn mint_token(secret: &str, subject: Option<&str>) -> Result<String, CliError> {
    let claims = match subject {
        Some(sub) => serde_json::json!({ "sub": sub }),
        None => serde_json::json!({}),
    };
    Ok(jsonwebtoken::encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))?)
}

fn run_token(args: &TokenArgs) -> Result<(), CliError> {
    println!("{}", mint_token(&args.secret, args.subject.as_deref())?);
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
