// ABOUTME: Background I/O thread serving every open channel
// ABOUTME: One task per channel accepts a single client, buffers inbound bytes and dispatches events

use super::channel::{ChannelEvent, ChannelId, Inbound};
use super::Shared;
use std::collections::HashMap;
use std::io;
use std::os::unix::net::UnixListener as StdUnixListener;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const READ_CHUNK: usize = 4096;

/// Requests from transport callers to the I/O thread
pub(crate) enum IoCommand {
    /// Start serving a bound listener
    Open {
        channel: ChannelId,
        generation: u64,
        listener: StdUnixListener,
    },
    /// Tear down a channel's listener and client
    Close { channel: ChannelId },
    /// Tear down everything and exit
    Shutdown,
}

struct ChannelTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ChannelTask {
    async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            log::error!("Channel task failed: {}", e);
        }
    }
}

struct Connection {
    reader: UnixStream,
    inbound: Arc<Inbound>,
}

enum ReadOutcome {
    Data(usize),
    Eof,
    Failed(io::Error),
    SpaceAvailable,
}

enum Step {
    Shutdown,
    Accepted(io::Result<UnixStream>),
    Read(ReadOutcome),
}

/// Spawn the I/O thread with its own current-thread runtime
pub(crate) fn spawn_io_thread(
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<IoCommand>,
) -> io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("a2dp-transport-io".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    log::error!("Failed to build transport runtime: {}", e);
                    return;
                }
            };
            runtime.block_on(run(shared, commands));
            log::debug!("Transport I/O thread exiting");
        })
}

async fn run(shared: Arc<Shared>, mut commands: mpsc::UnboundedReceiver<IoCommand>) {
    let mut tasks: HashMap<ChannelId, ChannelTask> = HashMap::new();

    while let Some(command) = commands.recv().await {
        match command {
            IoCommand::Open {
                channel,
                generation,
                listener,
            } => {
                if let Some(task) = tasks.remove(&channel) {
                    task.stop().await;
                }

                let listener = match UnixListener::from_std(listener) {
                    Ok(listener) => listener,
                    Err(e) => {
                        log::error!("Channel {}: cannot register listener: {}", channel, e);
                        shared.release(channel, generation);
                        continue;
                    }
                };

                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                let handle = tokio::spawn(serve_channel(
                    shared.clone(),
                    channel,
                    generation,
                    listener,
                    shutdown_rx,
                ));
                tasks.insert(
                    channel,
                    ChannelTask {
                        shutdown: shutdown_tx,
                        handle,
                    },
                );
            }
            IoCommand::Close { channel } => {
                if let Some(task) = tasks.remove(&channel) {
                    task.stop().await;
                }
            }
            IoCommand::Shutdown => break,
        }
    }

    for (_, task) in tasks.drain() {
        task.stop().await;
    }
}

async fn next_read(connection: &mut Option<Connection>, chunk: &mut [u8]) -> ReadOutcome {
    let Some(connection) = connection.as_mut() else {
        return std::future::pending().await;
    };

    if connection.inbound.is_full() {
        connection.inbound.space.notified().await;
        return ReadOutcome::SpaceAvailable;
    }

    match connection.reader.read(chunk).await {
        Ok(0) => ReadOutcome::Eof,
        Ok(n) => ReadOutcome::Data(n),
        Err(e) => ReadOutcome::Failed(e),
    }
}

fn into_parts(stream: UnixStream) -> io::Result<(UnixStream, std::os::unix::net::UnixStream)> {
    let stream = stream.into_std()?;
    let writer = stream.try_clone()?;
    let reader = UnixStream::from_std(stream)?;
    Ok((reader, writer))
}

async fn serve_channel(
    shared: Arc<Shared>,
    channel: ChannelId,
    generation: u64,
    listener: UnixListener,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connection: Option<Connection> = None;
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let step = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    Step::Shutdown
                } else {
                    continue;
                }
            }
            accepted = listener.accept() => Step::Accepted(accepted.map(|(stream, _)| stream)),
            outcome = next_read(&mut connection, &mut chunk) => Step::Read(outcome),
        };

        match step {
            Step::Shutdown => break,
            Step::Accepted(Ok(stream)) => {
                if connection.take().is_some() {
                    log::info!("Channel {}: new client replaces the attached one", channel);
                    shared.detach_client(channel, generation);
                    shared.dispatch(channel, ChannelEvent::Closed);
                }

                let (reader, writer) = match into_parts(stream) {
                    Ok(parts) => parts,
                    Err(e) => {
                        log::warn!("Channel {}: failed to set up client: {}", channel, e);
                        continue;
                    }
                };

                match shared.attach_client(channel, generation, writer) {
                    Some(inbound) => {
                        log::debug!("Channel {}: client connected", channel);
                        connection = Some(Connection { reader, inbound });
                        shared.dispatch(channel, ChannelEvent::Opened);
                    }
                    None => {
                        log::debug!("Channel {}: stale listener, dropping client", channel);
                    }
                }
            }
            Step::Accepted(Err(e)) => {
                log::warn!("Channel {}: accept failed: {}", channel, e);
            }
            Step::Read(ReadOutcome::Data(n)) => {
                if let Some(conn) = connection.as_ref() {
                    conn.inbound.push(&chunk[..n]);
                    shared.dispatch(channel, ChannelEvent::InboundDataReady);
                }
            }
            Step::Read(ReadOutcome::SpaceAvailable) => {}
            Step::Read(ReadOutcome::Eof) => {
                log::debug!("Channel {}: client detached", channel);
                connection = None;
                shared.detach_client(channel, generation);
                shared.dispatch(channel, ChannelEvent::Closed);
            }
            Step::Read(ReadOutcome::Failed(e)) => {
                log::warn!("Channel {}: read failed: {}", channel, e);
                connection = None;
                shared.detach_client(channel, generation);
                shared.dispatch(channel, ChannelEvent::Closed);
            }
        }
    }

    if connection.take().is_some() {
        shared.detach_client(channel, generation);
        shared.dispatch(channel, ChannelEvent::Closed);
    }
    shared.release(channel, generation);
    log::debug!("Channel {}: listener stopped", channel);
}
