//! Request/reply command channel.
//!
//! Clients connect to a unix socket and write one command per line. Each
//! line is answered with one JSON line `{"code": .., "notes": [..]}`.

use crate::error::HostResult;
use crate::host::ModuleHost;
use parking_lot::Mutex;
use rtx_hal::{CommandResult, CommandTarget};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Running command channel. Dropping it stops accepting and removes the socket.
pub struct CommandServer {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl CommandServer {
    /// Bind `path` and serve commands against `host`.
    ///
    /// A stale socket file at `path` is replaced.
    pub fn bind(path: &Path, host: Arc<Mutex<ModuleHost>>) -> HostResult<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let acceptor = std::thread::Builder::new()
            .name("rtx-commands".into())
            .spawn(move || accept_loop(listener, host, flag))?;
        info!("Command channel listening on {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            stop,
            acceptor: Some(acceptor),
        })
    }

    /// Socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CommandServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

fn accept_loop(listener: UnixListener, host: Arc<Mutex<ModuleHost>>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                let host = Arc::clone(&host);
                let spawned = std::thread::Builder::new()
                    .name("rtx-command-client".into())
                    .spawn(move || {
                        if let Err(e) = serve_client(stream, &host) {
                            debug!("Command client gone: {}", e);
                        }
                    });
                if let Err(e) = spawned {
                    warn!("Cannot serve command client: {}", e);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                warn!("Command channel accept failed: {}", e);
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn serve_client(stream: UnixStream, host: &Mutex<ModuleHost>) -> HostResult<()> {
    stream.set_nonblocking(false)?;
    let mut writer = stream.try_clone()?;
    for line in BufReader::new(stream).lines() {
        let line = line?;
        let res = host.lock().execute_line(&line);
        debug!("'{}' -> {}", line.trim(), res.code);
        let mut json = serde_json::to_string(&res)?;
        json.push('\n');
        writer.write_all(json.as_bytes())?;
    }
    Ok(())
}

/// Send one command line to the channel at `path` and wait for the reply.
pub fn send_command(path: &Path, line: &str) -> HostResult<CommandResult> {
    let mut stream = UnixStream::connect(path)?;
    stream.write_all(line.trim_end().as_bytes())?;
    stream.write_all(b"\n")?;
    let mut reply = String::new();
    BufReader::new(stream).read_line(&mut reply)?;
    Ok(serde_json::from_str(&reply)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModuleRegistry;
    use rtx_common::flavor::Flavor;
    use rtx_hal::HalStore;

    #[test]
    fn commands_round_trip_over_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.sock");
        let store = Arc::new(HalStore::in_memory(256 * 1024, 256).unwrap());
        let host = ModuleHost::new(store, None, Flavor::Posix, ModuleRegistry::with_builtins());
        let server = CommandServer::bind(&path, Arc::new(Mutex::new(host))).unwrap();

        let res = send_command(server.path(), "loadrt scale").unwrap();
        assert!(res.is_ok(), "{:?}", res);
        let res = send_command(&path, "newinst scale s0 gain=2").unwrap();
        assert!(res.is_ok(), "{:?}", res);
        let res = send_command(&path, "list pin s0.*").unwrap();
        assert_eq!(res.notes, vec!["s0.in", "s0.out"]);
        let res = send_command(&path, "unloadrt nosuch").unwrap();
        assert_eq!(res.code, -libc::ENOENT);

        drop(server);
        assert!(!path.exists());
    }
}
