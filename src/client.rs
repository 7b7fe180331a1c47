use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use crate::error::Result;
use crate::protocol::{build_ack, to_hex, FrameScanner, Packet};
use crate::telemetry::TelemetryReport;

/// Callback invoked for every parsed telemetry frame.
pub type ReportCallback = Arc<dyn Fn(TelemetryReport) + Send + Sync>;

/// Default per-read timeout in sec. The logger pushes a frame roughly
/// every half minute, so a quiet minute means the link is dead.
const DEFAULT_READ_TIMEOUT_SEC: u64 = 60;
/// Default delay before reconnecting after a failure, in sec.
const DEFAULT_RECONNECT_DELAY_SEC: u64 = 60;
/// Read chunk size. Frames are at most 86 bytes.
const READ_CHUNK_LEN: usize = 256;

/// Client builder, in builder pattern.
pub struct Evt800Builder {
    /// Logger address on the local network.
    addr: String,
    /// TCP port the logger listens on.
    port: u16,
    /// Per-read timeout.
    read_timeout: Duration,
    /// Delay before reconnecting after a failed session.
    reconnect_delay: Duration,
    /// Callback called for each telemetry frame.
    on_report: Option<ReportCallback>,
}

impl Evt800Builder {
    /// Create a builder for the logger at `addr:port`.
    pub fn new(addr: &str, port: u16) -> Self {
        Self {
            addr: addr.to_string(),
            port,
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SEC),
            reconnect_delay: Duration::from_secs(DEFAULT_RECONNECT_DELAY_SEC),
            on_report: None,
        }
    }

    /// Set per-read timeout.
    pub fn read_timeout(mut self, duration: Duration) -> Self {
        self.read_timeout = duration;
        self
    }

    /// Set the delay before reconnecting after a failed session.
    pub fn reconnect_delay(mut self, duration: Duration) -> Self {
        self.reconnect_delay = duration;
        self
    }

    /// Set callback function which will be called when a telemetry frame comes.
    pub fn on_report(mut self, callback: ReportCallback) -> Self {
        self.on_report = Some(callback);
        self
    }

    /// Build a valid [`Evt800`] structure. `panic` if the callback is not set.
    pub fn build(self) -> Evt800 {
        Evt800 {
            target: format!("{}:{}", self.addr, self.port),
            read_timeout: self.read_timeout,
            reconnect_delay: self.reconnect_delay,
            on_report: self.on_report.expect("You should set the report callback."),
            shared: Arc::new(Shared::default()),
            stop_tx: None,
            task: None,
        }
    }
}

/// State shared between the client handle and its read task.
#[derive(Default)]
struct Shared {
    /// True while a TCP session to the logger is live.
    online: AtomicBool,
    /// Whether the current outage has been logged at warn level already.
    unavailable_logged: AtomicBool,
    /// Serial number learned from the logger's announce frames.
    serial_number: Mutex<Option<String>>,
}

/// Client for the Envertech EVT800 data logger.
///
/// Owns one background read task which connects to the logger, parses its
/// frames, acknowledges each of them and hands telemetry to the callback.
pub struct Evt800 {
    /// `addr:port` of the logger.
    target: String,
    read_timeout: Duration,
    reconnect_delay: Duration,
    on_report: ReportCallback,
    shared: Arc<Shared>,
    /// Stop signal to the read task.
    stop_tx: Option<watch::Sender<bool>>,
    /// Handle of the read task.
    task: Option<JoinHandle<()>>,
}

impl Evt800 {
    /// Spawn the background TCP read task. Does nothing if it is running.
    pub fn start(&mut self) {
        if self.task.is_some() {
            warn!("Read task is already running.");
            return;
        }
        debug!("Starting TCP read task");

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = ReadTask {
            target: self.target.clone(),
            read_timeout: self.read_timeout,
            reconnect_delay: self.reconnect_delay,
            on_report: self.on_report.clone(),
            shared: Arc::clone(&self.shared),
        };
        self.task = Some(tokio::spawn(task.run(stop_rx)));
        self.stop_tx = Some(stop_tx);
    }

    /// Stop the read task and wait for it to finish.
    pub async fn stop(&mut self) -> Result<()> {
        debug!("Stopping TCP read task");
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        if let Some(task) = self.task.take() {
            task.await?;
        }
        Ok(())
    }

    /// True while a TCP session to the logger is live.
    pub fn online(&self) -> bool {
        self.shared.online.load(Ordering::SeqCst)
    }

    /// Serial number of the logger, once an announce frame has been seen.
    pub fn serial_number(&self) -> Option<String> {
        self.shared
            .serial_number
            .lock()
            .ok()
            .and_then(|serial| serial.clone())
    }
}

/// The background read task. Runs sessions against the logger until stopped,
/// sleeping between retries when a session fails.
struct ReadTask {
    target: String,
    read_timeout: Duration,
    reconnect_delay: Duration,
    on_report: ReportCallback,
    shared: Arc<Shared>,
}

impl ReadTask {
    async fn run(self, mut stop: watch::Receiver<bool>) {
        while !*stop.borrow() {
            match self.session(&mut stop).await {
                // The logger closed the connection; reconnect right away.
                Ok(()) => debug!("Session closed by the logger."),
                Err(e) => {
                    self.shared.online.store(false, Ordering::SeqCst);
                    if !self.shared.unavailable_logged.swap(true, Ordering::SeqCst) {
                        warn!("EVT800 unavailable: {}", e);
                    } else {
                        debug!("EVT800 still unavailable: {}", e);
                    }
                    if !*stop.borrow() {
                        debug!(
                            "Retrying connection in {} seconds...",
                            self.reconnect_delay.as_secs()
                        );
                        tokio::select! {
                            _ = stop.changed() => {}
                            _ = tokio::time::sleep(self.reconnect_delay) => {}
                        }
                    }
                }
            }
        }
        self.shared.online.store(false, Ordering::SeqCst);
        debug!("Read task exited.");
    }

    /// One TCP session: connect, then read and acknowledge frames until
    /// the stop signal, EOF, an error or a read timeout.
    async fn session(&self, stop: &mut watch::Receiver<bool>) -> Result<()> {
        info!("Connecting to EVT800 at {}", self.target);
        let mut stream = TcpStream::connect(self.target.as_str()).await?;

        self.shared.online.store(true, Ordering::SeqCst);
        if self.shared.unavailable_logged.swap(false, Ordering::SeqCst) {
            info!("EVT800 is back online");
        }
        info!("Connected to EVT800 at {}", self.target);

        let mut scanner = FrameScanner::new();
        let mut chunk = [0u8; READ_CHUNK_LEN];
        loop {
            let count = tokio::select! {
                _ = stop.changed() => break,
                read = timeout(self.read_timeout, stream.read(&mut chunk)) => read??,
            };
            if count == 0 {
                break;
            }

            scanner.push(&chunk[..count]);
            while let Some(frame) = scanner.next_frame() {
                self.handle_frame(&frame, &mut stream).await?;
            }
        }

        self.shared.online.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Sort one frame, dispatch its content, and acknowledge it.
    async fn handle_frame(&self, frame: &[u8], stream: &mut TcpStream) -> Result<()> {
        debug!("Received frame: {}", to_hex(frame));
        match Packet::classify(frame) {
            Ok(Packet::Telemetry(report)) => (self.on_report)(report),
            Ok(Packet::Announce { serial }) => {
                debug!("Logger serial number: {}", serial);
                if let Ok(mut slot) = self.shared.serial_number.lock() {
                    *slot = Some(serial);
                }
            }
            Ok(Packet::Unknown) => debug!("Frame of {} bytes left unparsed", frame.len()),
            Err(e) => warn!("Failed to parse frame: {}", e),
        }

        match build_ack(frame) {
            Some(ack) => {
                stream.write_all(&ack).await?;
                debug!("Sent ACK: {}", to_hex(&ack));
            }
            None => warn!("Frame too short for ACK, not sent"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::net::TcpListener;

    const TELEMETRY_FRAME: &str = "680056681004315258207a007a01000000000000315258207a7a40b02d860000\
                                   bafb2e8c3c4931fe000000000000000000000000315258217a7a3131017b0000\
                                   0e4a2ab33c4931fe020200000000000000000000ef16";
    const ANNOUNCE_FRAME: &str = "680020681006315258200000000000014b0000e7010000010500000000009016";
    const EXPECTED_ACK: &str = "68001068105031525820000000007816";

    fn unhex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    /// Accept one connection, send `frame`, report the bytes the client
    /// wrote back, and hold the socket open until `close_rx` fires.
    async fn serve_one_frame(
        listener: TcpListener,
        frame: Vec<u8>,
        ack_tx: tokio::sync::oneshot::Sender<Vec<u8>>,
        close_rx: tokio::sync::oneshot::Receiver<()>,
    ) {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket.write_all(&frame).await.unwrap();

        let mut ack = vec![0u8; 64];
        let count = socket.read(&mut ack).await.unwrap();
        ack.truncate(count);
        let _ = ack_tx.send(ack);
        let _ = close_rx.await;
    }

    #[test]
    fn test_builder_with_valid_address() {
        let client = Evt800Builder::new("192.168.2.66", 14889)
            .on_report(Arc::new(|_| {}))
            .build();
        assert!(!client.online());
        assert_eq!(client.serial_number(), None);
    }

    #[tokio::test]
    async fn test_client_delivers_telemetry_and_acks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
        let (close_tx, close_rx) = tokio::sync::oneshot::channel();
        let server = tokio::spawn(serve_one_frame(
            listener,
            unhex(TELEMETRY_FRAME),
            ack_tx,
            close_rx,
        ));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let callback: ReportCallback = Arc::new(move |report| {
            let _ = tx.send(report);
        });
        let mut client = Evt800Builder::new("127.0.0.1", port)
            .on_report(callback)
            .build();
        client.start();

        let report = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.sw_version, "7A.7A");
        assert_eq!(report.channels[0].id, 49_828_832);
        assert_eq!(report.channels[1].id, 49_828_833);

        let ack = timeout(Duration::from_secs(5), ack_rx).await.unwrap().unwrap();
        assert_eq!(ack, unhex(EXPECTED_ACK));
        // The session is still live, the server has not hung up yet.
        assert!(client.online());

        let _ = close_tx.send(());
        server.await.unwrap();
        client.stop().await.unwrap();
        assert!(!client.online());
    }

    #[tokio::test]
    async fn test_client_learns_serial_number() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
        let (close_tx, close_rx) = tokio::sync::oneshot::channel();
        let server = tokio::spawn(serve_one_frame(
            listener,
            unhex(ANNOUNCE_FRAME),
            ack_tx,
            close_rx,
        ));

        let mut client = Evt800Builder::new("127.0.0.1", port)
            .on_report(Arc::new(|_| {}))
            .build();
        client.start();

        // The serial is stored before the ACK goes out, so once the ACK
        // has arrived the handle must expose it.
        let ack = timeout(Duration::from_secs(5), ack_rx).await.unwrap().unwrap();
        assert_eq!(ack, unhex(EXPECTED_ACK));
        assert_eq!(client.serial_number().as_deref(), Some("31525820"));

        let _ = close_tx.send(());
        server.await.unwrap();
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_while_unreachable() {
        // Nothing listens on this port; the client should keep retrying
        // until it is told to stop.
        let mut client = Evt800Builder::new("127.0.0.1", 1)
            .reconnect_delay(Duration::from_secs(60))
            .on_report(Arc::new(|_| {}))
            .build();
        client.start();

        tokio::time::sleep(Duration::from_millis(50)).await;
        timeout(Duration::from_secs(5), client.stop())
            .await
            .unwrap()
            .unwrap();
        assert!(!client.online());
    }
}
