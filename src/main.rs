use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use qio::{Qd, QToken, Runtime, Sga};

const HTTP_WORKERS: usize = 2;

// How often idle workers look at the shutdown flag.
const TICK: Duration = Duration::from_millis(100);

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let runtime = Arc::new(Runtime::new()?);
    let running = Arc::new(AtomicBool::new(true));

    let mut threads = Vec::new();
    let mut workers = Vec::new();

    // HTTP workers report each answered client here.
    let answered = runtime.create_memory_queue()?;

    for id in 0..HTTP_WORKERS {
        let qd = runtime.create_memory_queue()?;
        workers.push(qd);

        let runtime = runtime.clone();
        let running = running.clone();
        threads.push(thread::spawn(move || http_worker(id, &runtime, qd, answered, &running)));
    }

    let intake = runtime.create_memory_queue()?;
    {
        let runtime = runtime.clone();
        let running = running.clone();
        threads.push(thread::spawn(move || {
            tcp_worker(&runtime, intake, answered, &workers, &running)
        }));
    }

    let addr: SocketAddr = "127.0.0.1:8080".parse()?;
    let listener = runtime.create_network_queue(libc::AF_INET, libc::SOCK_STREAM, 0)?;
    runtime.bind(listener, addr)?;
    runtime.listen(listener, 128)?;
    tracing::info!(%addr, "listening");

    let mut accept = runtime.accept(listener)?;
    while running.load(Ordering::Acquire) {
        let result = match runtime.wait_timeout(accept, TICK)? {
            Some(result) => result,
            None => continue,
        };
        accept = runtime.accept(listener)?;

        match result.into_accepted() {
            Ok(client) => {
                let push = runtime.push(intake, encode(client))?;
                runtime.wait(push)?;
            }
            Err(err) => tracing::warn!(%err, "accept failed"),
        }
    }

    runtime.close(listener)?;

    for thread in threads {
        match thread.join() {
            Ok(result) => result?,
            Err(_) => anyhow::bail!("worker panicked"),
        }
    }

    tracing::info!("shut down");
    Ok(())
}

/// Responses still owed to each client. A client that hung up is only closed
/// once nothing is owed, so its descriptor cannot be reused by a new
/// connection while a worker is still answering.
#[derive(Default)]
struct Owed {
    pending: HashMap<Qd, usize>,
    hung_up: HashSet<Qd>,
}

impl Owed {
    fn forwarded(&mut self, client: Qd) {
        *self.pending.entry(client).or_default() += 1;
    }

    /// Returns true if the client can be closed now.
    fn answered(&mut self, client: Qd) -> bool {
        match self.pending.get_mut(&client) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.pending.remove(&client);
                self.hung_up.remove(&client)
            }
            None => false,
        }
    }

    /// Returns true if the client can be closed now.
    fn hang_up(&mut self, client: Qd) -> bool {
        if self.pending.contains_key(&client) {
            self.hung_up.insert(client);
            false
        } else {
            true
        }
    }
}

fn encode(qd: Qd) -> Sga {
    Sga::from(qd.0.to_le_bytes().to_vec())
}

fn decode(bytes: &[u8]) -> anyhow::Result<Qd> {
    let bytes = bytes.get(..4).context("short descriptor")?;
    Ok(Qd(i32::from_le_bytes(bytes.try_into()?)))
}

fn close_client(runtime: &Runtime, client: Qd) {
    if let Err(err) = runtime.close(client) {
        tracing::warn!(%client, %err, "failed to close client");
    }
}

// Pops requests from every client and hands them to the HTTP workers in turn.
fn tcp_worker(
    runtime: &Runtime,
    intake: Qd,
    answered: Qd,
    workers: &[Qd],
    running: &AtomicBool,
) -> anyhow::Result<()> {
    // The first two slots are never removed.
    let mut queues = vec![intake, answered];
    let mut tokens: Vec<QToken> = vec![runtime.pop(intake)?, runtime.pop(answered)?];
    let mut owed = Owed::default();
    let mut next = 0;

    while running.load(Ordering::Acquire) {
        let (index, result) = match runtime.wait_any_timeout(&tokens, TICK)? {
            Some(ready) => ready,
            None => continue,
        };
        let qd = queues[index];

        if qd == intake {
            let client = decode(&result.into_sga()?.to_vec())?;
            tokens[index] = runtime.pop(intake)?;

            queues.push(client);
            tokens.push(runtime.pop(client)?);

            tracing::debug!(%client, "new client");
            continue;
        }

        if qd == answered {
            let client = decode(&result.into_sga()?.to_vec())?;
            tokens[index] = runtime.pop(answered)?;

            if owed.answered(client) {
                close_client(runtime, client);
            }
            continue;
        }

        let request = match result.into_sga() {
            Ok(request) => request,
            Err(err) => {
                tracing::debug!(%qd, %err, "client gone");
                queues.swap_remove(index);
                tokens.swap_remove(index);

                if owed.hang_up(qd) {
                    close_client(runtime, qd);
                }
                continue;
            }
        };

        // First segment names the client to answer.
        let mut message = encode(qd);
        for segment in request.into_segments() {
            message.push_segment(segment);
        }

        let push = runtime.push(workers[next], message)?;
        runtime.wait(push)?;
        owed.forwarded(qd);
        next = (next + 1) % workers.len();

        tokens[index] = runtime.pop(qd)?;
    }

    Ok(())
}

fn http_worker(id: usize, runtime: &Runtime, queue: Qd, answered: Qd, running: &AtomicBool) -> anyhow::Result<()> {
    let mut pop = runtime.pop(queue)?;

    while running.load(Ordering::Acquire) {
        let result = match runtime.wait_timeout(pop, TICK)? {
            Some(result) => result,
            None => continue,
        };
        pop = runtime.pop(queue)?;

        let mut segments = result.into_sga()?.into_segments().into_iter();
        let header = segments.next().context("empty message")?;
        let client = decode(&header)?;

        let request = Sga::from_segments(segments.collect());
        let bytes = request.to_vec();
        runtime.release(request);

        if is_shutdown(&bytes) {
            tracing::info!(%client, "shutdown requested");
            running.store(false, Ordering::Release);
        }

        let response = respond(&bytes);
        tracing::debug!(worker = id, %client, status = %status_line(&response), "responding");

        // A reset connection fails the push; the descriptor stays ours until
        // the TCP worker hears back below.
        let sent = runtime
            .push(client, Sga::from(response))
            .and_then(|push| runtime.wait(push))
            .and_then(|result| result.into_sga());

        match sent {
            Ok(buffer) => runtime.release(buffer),
            Err(err) => tracing::debug!(worker = id, %client, %err, "response dropped"),
        }

        let push = runtime.push(answered, encode(client))?;
        runtime.wait(push)?;
    }

    Ok(())
}

// Method, target and version out of the request line.
fn request_line(request: &[u8]) -> Option<(&str, &str, &str)> {
    let line = request.split(|&b| b == b'\n').next()?;
    let line = std::str::from_utf8(line).ok()?.trim_end_matches('\r');

    let mut parts = line.split(' ');
    let method = parts.next()?;
    let target = parts.next()?;
    let version = parts.next()?;

    if parts.next().is_some() || method.is_empty() || !target.starts_with('/') || !version.starts_with("HTTP/1.") {
        return None;
    }

    Some((method, target, version))
}

fn is_shutdown(request: &[u8]) -> bool {
    matches!(request_line(request), Some((_, "/shutdown", _)))
}

fn respond(request: &[u8]) -> Vec<u8> {
    match request_line(request) {
        Some(_) => b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK".to_vec(),
        None => b"HTTP/1.1 400 BAD REQUEST\r\nContent-Length: 0\r\n\r\n".to_vec(),
    }
}

fn status_line(response: &[u8]) -> String {
    let line = response.split(|&b| b == b'\r').next().unwrap_or_default();
    String::from_utf8_lossy(line).into_owned()
}
