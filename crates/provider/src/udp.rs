//! UDP message provider
//!
//! Binds a UDP socket and collects every received datagram as a message.
//! One message at a time backs the logical bytes; selecting another
//! message changes what `size()` and `read()` observe. The store is
//! append-only and never writable.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::controls::ProviderControls;
use crate::error::ProviderError;
use crate::Provider;

const MAX_DATAGRAM: usize = 0x1_0000;
const RECV_POLL: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct UdpMessage {
    pub bytes: Vec<u8>,
    pub received_at: SystemTime,
}

pub struct UdpProvider {
    port: u16,
    messages: Arc<Mutex<Vec<UdpMessage>>>,
    selected: Mutex<usize>,
    running: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
    controls: ProviderControls,
}

impl UdpProvider {
    /// Bind `0.0.0.0:port` and start collecting datagrams on a background
    /// thread.
    pub fn bind(port: u16) -> Result<Self, ProviderError> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        socket.set_read_timeout(Some(RECV_POLL))?;
        let port = socket.local_addr()?.port();

        let messages = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicBool::new(true));

        let receiver = {
            let messages = Arc::clone(&messages);
            let running = Arc::clone(&running);
            std::thread::spawn(move || {
                let mut buf = vec![0u8; MAX_DATAGRAM];
                while running.load(Ordering::Acquire) {
                    match socket.recv_from(&mut buf) {
                        Ok((len, peer)) => {
                            debug!(%peer, len, "received datagram");
                            let mut messages =
                                messages.lock().unwrap_or_else(|e| e.into_inner());
                            messages.push(UdpMessage {
                                bytes: buf[..len].to_vec(),
                                received_at: SystemTime::now(),
                            });
                        }
                        Err(e)
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut => {}
                        Err(e) => {
                            warn!(error = %e, "udp receive failed, stopping");
                            break;
                        }
                    }
                }
            })
        };

        Ok(Self {
            port,
            messages,
            selected: Mutex::new(0),
            running,
            receiver: Some(receiver),
            controls: ProviderControls::new(),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Snapshot of all received messages.
    pub fn messages(&self) -> Vec<UdpMessage> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Choose which message backs the logical bytes.
    pub fn select_message(&self, index: usize) {
        *self.selected.lock().unwrap_or_else(|e| e.into_inner()) = index;
    }

    pub fn selected_message(&self) -> usize {
        *self.selected.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    pub(crate) fn push_message(&self, bytes: Vec<u8>) {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(UdpMessage {
                bytes,
                received_at: SystemTime::now(),
            });
    }
}

impl Provider for UdpProvider {
    fn name(&self) -> String {
        format!("udp :{}", self.port)
    }

    fn type_name(&self) -> &'static str {
        "udp"
    }

    fn description(&self) -> Vec<(String, String)> {
        vec![
            ("port".into(), self.port.to_string()),
            ("messages".into(), self.message_count().to_string()),
            ("selected".into(), self.selected_message().to_string()),
        ]
    }

    fn is_writable(&self) -> bool {
        false
    }

    fn controls(&self) -> &ProviderControls {
        &self.controls
    }

    fn read_raw(&self, offset: u64, buf: &mut [u8]) -> Result<(), ProviderError> {
        let messages = self.messages.lock().unwrap_or_else(|e| e.into_inner());
        let selected = *self.selected.lock().unwrap_or_else(|e| e.into_inner());

        let bytes = messages
            .get(selected)
            .map(|m| m.bytes.as_slice())
            .unwrap_or(&[]);

        let start = offset as usize;
        let end = match start.checked_add(buf.len()) {
            Some(end) if end <= bytes.len() => end,
            _ => {
                return Err(ProviderError::OutOfRange {
                    offset,
                    size: buf.len() as u64,
                    provider_size: bytes.len() as u64,
                });
            }
        };
        buf.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write_raw(&self, _offset: u64, _data: &[u8]) -> Result<(), ProviderError> {
        Err(ProviderError::NotWritable(self.name()))
    }

    fn actual_size(&self) -> u64 {
        let messages = self.messages.lock().unwrap_or_else(|e| e.into_inner());
        let selected = *self.selected.lock().unwrap_or_else(|e| e.into_inner());
        messages.get(selected).map_or(0, |m| m.bytes.len() as u64)
    }
}

impl Drop for UdpProvider {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.receiver.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_tracks_selected_message() {
        let provider = UdpProvider::bind(0).unwrap();
        provider.push_message(vec![1, 2, 3]);
        provider.push_message(vec![4, 5, 6, 7, 8]);

        assert_eq!(provider.actual_size(), 3);

        provider.select_message(1);
        assert_eq!(provider.actual_size(), 5);

        let mut buf = [0u8; 2];
        provider.read(3, &mut buf).unwrap();
        assert_eq!(buf, [7, 8]);
    }

    #[test]
    fn test_empty_provider_reads_nothing() {
        let provider = UdpProvider::bind(0).unwrap();
        assert_eq!(provider.actual_size(), 0);

        let mut buf = [0u8; 1];
        assert!(matches!(
            provider.read(0, &mut buf),
            Err(ProviderError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_datagrams_are_collected() {
        let provider = UdpProvider::bind(0).unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender
            .send_to(b"ping", ("127.0.0.1", provider.port()))
            .unwrap();

        // The receive thread polls every 50ms.
        for _ in 0..40 {
            if provider.message_count() > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(25));
        }

        assert_eq!(provider.message_count(), 1);
        assert_eq!(provider.messages()[0].bytes, b"ping");
    }
}
