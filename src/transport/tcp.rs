//! TCP transport for the broker.
//!
//! Accepts framed connections and translates incoming frames into engine
//! operations. Responsibilities:
//! - accept connections, enforcing the configured connection cap
//! - register a `ClientConn` for each connection with the `Broker`
//! - run a send-loop task draining the connection's outbound frame queue
//! - read frames and dispatch them to the engine
//! - clean the client up exactly once, whichever loop ends first

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::engine::{Broker, ClientConn};
use crate::broker::topic::ClientId;
use crate::transport::frame::{
    Frame, FrameKind, MAX_FRAME_PAYLOAD, ReportBody, read_frame, write_frame,
};

/// Runs the broker accept loop until the listener fails.
pub async fn start_broker_server(listener: TcpListener, broker: Arc<Broker>) {
    match listener.local_addr() {
        Ok(addr) => info!("broker listening on {addr}"),
        Err(_) => info!("broker listening"),
    }

    while let Ok((stream, _)) = listener.accept().await {
        if broker.client_count() >= broker.settings().max_connections {
            warn!("connection limit reached, rejecting client");
            continue;
        }
        let broker = broker.clone();
        tokio::spawn(handle_client(stream, broker));
    }
}

async fn handle_client(stream: TcpStream, broker: Arc<Broker>) {
    let client_id: ClientId = format!("client-{}", Uuid::new_v4());
    let (mut read_half, write_half) = stream.into_split();

    // Channel for this client; the engine fans out into it
    let (tx, rx) = mpsc::channel::<Frame>(broker.settings().queue_capacity);
    broker.register_client(ClientConn {
        id: client_id.clone(),
        sender: tx.clone(),
    });

    let cleanup_called = Arc::new(AtomicBool::new(false));
    let do_cleanup = {
        let broker = broker.clone();
        let client_id = client_id.clone();
        let cleanup_called = cleanup_called.clone();

        move || {
            if !cleanup_called.swap(true, Ordering::SeqCst) {
                broker.cleanup_client(&client_id);
            }
        }
    };

    {
        let client_id = client_id.clone();
        let do_cleanup = do_cleanup.clone();
        tokio::spawn(async move {
            send_loop(write_half, rx, &client_id).await;
            do_cleanup();
            debug!("send loop closed for {client_id}");
        });
    }

    loop {
        match read_frame(&mut read_half, MAX_FRAME_PAYLOAD).await {
            Ok(frame) => handle_frame(&broker, &client_id, &tx, frame),
            Err(e) => {
                debug!("{client_id} disconnected: {e}");
                break;
            }
        }
    }
    do_cleanup();
}

/// Forwards queued frames from the engine to the client socket.
async fn send_loop(mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Frame>, client_id: &str) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut write_half, &frame).await {
            debug!("failed to send to {client_id}: {e}");
            break;
        }
    }
}

fn handle_frame(broker: &Broker, client_id: &ClientId, tx: &mpsc::Sender<Frame>, frame: Frame) {
    match frame.kind {
        FrameKind::RegisterPublisher => {
            broker.register_publisher(&frame.topic, client_id);
            confirm(tx, &frame, client_id);
        }
        FrameKind::RegisterSubscriber => {
            broker.register_subscriber(&frame.topic, client_id);
            confirm(tx, &frame, client_id);
        }
        FrameKind::Unregister => {
            broker.unregister(&frame.topic, client_id, frame.subscriber_role);
        }
        FrameKind::Data => {
            if let Some(report) = broker.publish(
                client_id,
                frame.seq,
                &frame.topic,
                frame.reliability,
                frame.payload,
            ) {
                if tx
                    .try_send(Frame::report(&frame.topic, frame.seq, report))
                    .is_err()
                {
                    debug!("report to {client_id} dropped, queue full");
                }
            }
        }
        FrameKind::Ack => broker.handle_ack(&frame.topic, frame.seq, client_id),
        FrameKind::Report => debug!("unexpected report frame from {client_id}"),
    }
}

/// Confirms a registration so the client can return from create_*.
fn confirm(tx: &mpsc::Sender<Frame>, request: &Frame, client_id: &str) {
    if tx
        .try_send(Frame::report(&request.topic, request.seq, ReportBody::ok(0)))
        .is_err()
    {
        debug!("registration confirm to {client_id} dropped, queue full");
    }
}
