//! Blocking accept loops with tracked connections and bounded shutdown.
//!
//! One accept thread per listener, one thread per connection. Listener
//! sockets run non-blocking so the accept loop can observe its shutdown flag
//! between retries; the handle joins outstanding connections on teardown.

use super::NetError;
use log::{error, warn};
use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(25);

struct AcceptLoopState {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl AcceptLoopState {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn mark_stopped(&self) {
        if let Ok(mut done) = self.done.lock() {
            *done = true;
        }
        self.condvar.notify_all();
    }

    fn wait_for_stop(&self, timeout: Duration, name: &'static str) -> Result<(), NetError> {
        let guard = self
            .done
            .lock()
            .map_err(|_| NetError::Poisoned { context: name })?;
        if *guard {
            return Ok(());
        }
        let (next, _status) = self
            .condvar
            .wait_timeout(guard, timeout)
            .map_err(|_| NetError::Poisoned { context: name })?;
        if *next {
            Ok(())
        } else {
            Err(NetError::ShutdownTimeout { context: name })
        }
    }
}

#[derive(Default)]
struct ConnectionTracker {
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ConnectionTracker {
    fn track(&self, handle: thread::JoinHandle<()>) {
        if let Ok(mut handles) = self.handles.lock() {
            handles.retain(|existing| !existing.is_finished());
            handles.push(handle);
        }
    }

    fn join_all(&self) {
        let drained = match self.handles.lock() {
            Ok(mut handles) => handles.drain(..).collect::<Vec<_>>(),
            Err(_) => Vec::new(),
        };
        for handle in drained {
            let _ = handle.join();
        }
    }
}

/// Handle on a running listener; shutting down is idempotent.
pub struct ListenerHandle {
    name: &'static str,
    shutdown: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
    connections: Arc<ConnectionTracker>,
    state: Arc<AcceptLoopState>,
}

impl ListenerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn try_shutdown(&mut self, timeout: Duration) -> Result<(), NetError> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.join.take() {
            self.state.wait_for_stop(timeout, self.name)?;
            if handle.join().is_err() {
                warn!("event=listener_accept_loop_panic name={}", self.name);
            }
        }
        self.connections.join_all();
        Ok(())
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        let _ = self.try_shutdown(crate::timeouts::LISTENER_SHUTDOWN_GRACE);
    }
}

enum Accepted {
    Tcp(TcpStream, SocketAddr),
    Unix(UnixStream),
}

trait Acceptor: Send + 'static {
    fn set_nonblocking(&self) -> io::Result<()>;
    fn accept_one(&self) -> io::Result<Accepted>;
}

impl Acceptor for TcpListener {
    fn set_nonblocking(&self) -> io::Result<()> {
        TcpListener::set_nonblocking(self, true)
    }

    fn accept_one(&self) -> io::Result<Accepted> {
        self.accept().map(|(stream, addr)| Accepted::Tcp(stream, addr))
    }
}

impl Acceptor for UnixListener {
    fn set_nonblocking(&self) -> io::Result<()> {
        UnixListener::set_nonblocking(self, true)
    }

    fn accept_one(&self) -> io::Result<Accepted> {
        self.accept().map(|(stream, _)| Accepted::Unix(stream))
    }
}

fn spawn<A, F>(name: &'static str, listener: A, handler: F) -> io::Result<ListenerHandle>
where
    A: Acceptor,
    F: Fn(Accepted) -> Result<(), NetError> + Send + Sync + 'static,
{
    listener.set_nonblocking()?;
    let shutdown = Arc::new(AtomicBool::new(false));
    let tracker = Arc::new(ConnectionTracker::default());
    let handler = Arc::new(handler);
    let state = Arc::new(AcceptLoopState::new());

    let accept_shutdown = shutdown.clone();
    let accept_tracker = tracker.clone();
    let accept_state = state.clone();
    let join = thread::spawn(move || {
        loop {
            if accept_shutdown.load(Ordering::Relaxed) {
                break;
            }
            match listener.accept_one() {
                Ok(accepted) => {
                    let handler = handler.clone();
                    let connection = thread::spawn(move || {
                        if let Err(err) = handler(accepted) {
                            warn!("event={name}_connection_error error={err}");
                        }
                    });
                    accept_tracker.track(connection);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_BACKOFF);
                }
                Err(err) => {
                    error!("event={name}_accept_error error={err}");
                    break;
                }
            }
        }
        accept_state.mark_stopped();
    });

    Ok(ListenerHandle {
        name,
        shutdown,
        join: Some(join),
        connections: tracker,
        state,
    })
}

pub fn spawn_tcp(
    name: &'static str,
    listener: TcpListener,
    handler: impl Fn(TcpStream, SocketAddr) -> Result<(), NetError> + Send + Sync + 'static,
) -> io::Result<ListenerHandle> {
    spawn(name, listener, move |accepted| match accepted {
        Accepted::Tcp(stream, addr) => handler(stream, addr),
        Accepted::Unix(_) => Ok(()),
    })
}

pub fn spawn_unix(
    name: &'static str,
    listener: UnixListener,
    handler: impl Fn(UnixStream) -> Result<(), NetError> + Send + Sync + 'static,
) -> io::Result<ListenerHandle> {
    spawn(name, listener, move |accepted| match accepted {
        Accepted::Unix(stream) => handler(stream),
        Accepted::Tcp(..) => Ok(()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn tcp_listener_serves_and_stops() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let served = Arc::new(AtomicUsize::new(0));
        let counter = served.clone();
        let mut handle = spawn_tcp("test", listener, move |mut stream, _addr| {
            counter.fetch_add(1, Ordering::SeqCst);
            stream.write_all(b"hi").map_err(NetError::from)?;
            Ok(())
        })
        .unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        let mut buffer = Vec::new();
        client.read_to_end(&mut buffer).unwrap();
        assert_eq!(buffer, b"hi");
        handle.try_shutdown(Duration::from_secs(2)).unwrap();
        assert_eq!(served.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unix_listener_serves() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("test.socket");
        let listener = UnixListener::bind(&path).unwrap();
        let mut handle = spawn_unix("test_unix", listener, move |mut stream| {
            stream.write_all(b"ok").map_err(NetError::from)?;
            Ok(())
        })
        .unwrap();
        let mut client = UnixStream::connect(&path).unwrap();
        let mut buffer = Vec::new();
        client.read_to_end(&mut buffer).unwrap();
        assert_eq!(buffer, b"ok");
        handle.try_shutdown(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn double_shutdown_is_safe() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut handle = spawn_tcp("test2", listener, |_stream, _addr| Ok(())).unwrap();
        handle.try_shutdown(Duration::from_secs(2)).unwrap();
        handle.try_shutdown(Duration::from_secs(2)).unwrap();
    }
}
