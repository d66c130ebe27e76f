use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::TcpStream,
    select,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message},
};
use tracing::{info, warn};

use crate::cli::ClientArgs;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn run(args: ClientArgs) -> Result<()> {
    let mut socket = establish_connection(&args.url).await?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    run_client_loop(&mut socket, &mut stdin).await?;
    shutdown_connection(&mut socket).await;

    Ok(())
}

async fn establish_connection(url: &str) -> Result<Socket> {
    let (socket, _response) = connect_async(url)
        .await
        .with_context(|| format!("failed to connect to {url}"))?;

    info!("connected to {url}");
    Ok(socket)
}

/// `next_line` keeps a partly typed line buffered when a server message
/// wins the `select!`, so nothing the user typed is lost.
async fn run_client_loop<R>(socket: &mut Socket, stdin: &mut Lines<R>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        select! {
            server_message = socket.next() => {
                if !handle_server_message(server_message).await? {
                    break;
                }
            }
            line = stdin.next_line() => {
                if !handle_stdin_input(line, socket).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_message(
    message: Option<Result<Message, tungstenite::Error>>,
) -> Result<bool> {
    match message {
        Some(Ok(Message::Text(text))) => {
            write_stdout(&text).await?;
            Ok(true)
        }
        Some(Ok(Message::Binary(bytes))) => {
            write_stdout(&format!("<binary {} bytes>", bytes.len())).await?;
            Ok(true)
        }
        Some(Ok(Message::Close(_))) | None => {
            write_stdout("*** relay closed the connection").await?;
            Ok(false)
        }
        Some(Ok(_)) => Ok(true),
        Some(Err(err)) => Err(err).context("failed to read from relay"),
    }
}

async fn handle_stdin_input(line: io::Result<Option<String>>, socket: &mut Socket) -> Result<bool> {
    let Some(line) = line? else {
        return Ok(false);
    };

    let text = line.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving relay").await?;
        return Ok(false);
    }

    socket
        .send(Message::Text(text.to_string()))
        .await
        .context("failed to send message")?;
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(socket: &mut Socket) {
    if let Err(error) = socket.close(None).await {
        warn!(?error, "failed to close websocket cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
