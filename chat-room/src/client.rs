use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    connection::{ConnectionError, FrameReader, FrameWriter},
    frame::Message,
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let (reader, mut writer) = establish_connection(&args).await?;
    write_stdout(&format!("*** connected to {}", args.server)).await?;

    // Frames are read on their own task: a read cut short by `select!` would
    // lose the bytes of a partially received frame.
    let (inbound_tx, mut inbound) = mpsc::channel(16);
    let receiver = tokio::spawn(forward_inbound(reader, inbound_tx));

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    let result =
        run_client_loop(&mut inbound, &mut writer, &mut stdin, args.name.as_deref()).await;
    receiver.abort();
    shutdown_connection(&mut writer).await;

    result
}

async fn forward_inbound(
    mut reader: FrameReader<OwnedReadHalf>,
    inbound: mpsc::Sender<Result<Message, ConnectionError>>,
) {
    loop {
        let result = reader.read_message().await;
        let failed = result.is_err();
        if inbound.send(result).await.is_err() || failed {
            break;
        }
    }
}

async fn establish_connection(
    args: &ClientArgs,
) -> Result<(FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((FrameReader::new(reader), FrameWriter::new(writer)))
}

async fn run_client_loop<I, W>(
    inbound: &mut mpsc::Receiver<Result<Message, ConnectionError>>,
    writer: &mut FrameWriter<W>,
    stdin: &mut Lines<I>,
    name: Option<&str>,
) -> Result<()>
where
    I: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        // `next_line` buffers a partial line inside `Lines`, so losing the race
        // to a server frame does not drop what was typed so far.
        select! {
            server_message = inbound.recv() => {
                if !handle_server_message(server_message).await? {
                    break;
                }
            }
            line = stdin.next_line() => {
                if !handle_stdin_input(line, writer, name).await? {
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
    message: Option<Result<Message, ConnectionError>>,
) -> Result<bool> {
    match message {
        Some(Ok(message)) => {
            write_stdout(&message.text()).await?;
            Ok(true)
        }
        Some(Err(err)) if !err.is_closed() => Err(err).context("failed to read from server"),
        _ => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input<W>(
    line: io::Result<Option<String>>,
    writer: &mut FrameWriter<W>,
    name: Option<&str>,
) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let Some(line) = line? else {
        return Ok(false);
    };

    let text = line.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    let message = outgoing_message(name, text);
    writer
        .write_message(&message)
        .await
        .context("failed to send message")?;
    Ok(true)
}

/// Builds the frame body for one typed line; long lines are cut to the frame limit.
fn outgoing_message(name: Option<&str>, text: &str) -> Message {
    match name {
        Some(name) => Message::from_text(&format!("{name}: {text}")),
        None => Message::from_text(text),
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut FrameWriter<OwnedWriteHalf>) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
