//! Single writer for HTLC interceptor replies

use super::{CircuitKey, ForwardHtlcInterceptResponse};
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

enum Command {
    Attach(mpsc::Sender<ForwardHtlcInterceptResponse>),
    Resolve(ForwardHtlcInterceptResponse),
}

/// Handle to the task owning the interceptor's reply sink.
///
/// Any number of tasks may resolve HTLCs concurrently; the owning task
/// writes the replies one at a time. Replies issued while no interceptor is
/// registered are queued and flushed on the next [`attach`](Self::attach).
#[derive(Clone)]
pub struct HtlcResolver {
    tx: mpsc::UnboundedSender<Command>,
}

impl HtlcResolver {
    /// Spawn the owning task
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(rx));
        (Self { tx }, handle)
    }

    /// Install the reply sink of a freshly registered interceptor
    pub fn attach(&self, sink: mpsc::Sender<ForwardHtlcInterceptResponse>) {
        self.send(Command::Attach(sink));
    }

    /// Queue a reply
    pub fn resolve(&self, response: ForwardHtlcInterceptResponse) {
        self.send(Command::Resolve(response));
    }

    /// Let the HTLC continue forwarding
    pub fn resume(&self, key: CircuitKey) {
        self.resolve(ForwardHtlcInterceptResponse::resume(key));
    }

    /// Fail the HTLC back to the payer
    pub fn fail(&self, key: CircuitKey) {
        self.resolve(ForwardHtlcInterceptResponse::fail(key));
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            warn!("HTLC resolver task is gone, dropping command");
        }
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut sink: Option<mpsc::Sender<ForwardHtlcInterceptResponse>> = None;
    let mut queued: VecDeque<ForwardHtlcInterceptResponse> = VecDeque::new();

    while let Some(command) = rx.recv().await {
        match command {
            Command::Attach(new_sink) => {
                debug!("Interceptor sink attached, flushing {} queued replies", queued.len());
                sink = Some(new_sink);
            }
            Command::Resolve(response) => queued.push_back(response),
        }

        while let Some(response) = queued.pop_front() {
            let Some(current) = sink.as_ref() else {
                queued.push_front(response);
                break;
            };
            if let Err(mpsc::error::SendError(response)) = current.send(response).await {
                debug!("Interceptor sink closed, queueing {}", response.incoming_circuit_key);
                sink = None;
                queued.push_front(response);
                break;
            }
        }
    }

    debug!("HTLC resolver stopped with {} unsent replies", queued.len());
}
