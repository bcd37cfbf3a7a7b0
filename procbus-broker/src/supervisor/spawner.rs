//! Child process creation and RPC handle wiring.

// Layer 1: Standard library imports
#[cfg(unix)]
use std::os::fd::AsRawFd;
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::process::Stdio;

// Layer 2: Third-party crate imports
#[cfg(unix)]
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};

// Layer 3: Internal module imports
use crate::error::BrokerError;
use procbus_wire::rpc::{DEFAULT_CHILD_IN_SLOT, DEFAULT_CHILD_OUT_SLOT};

/// Numeric descriptor slots a child inherits for RPC, beyond the standard
/// three.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleSlots {
    /// Slot where the child reads broker-to-child frames
    pub child_in: i32,
    /// Slot where the child writes child-to-broker frames
    pub child_out: i32,
}

impl Default for HandleSlots {
    fn default() -> Self {
        Self {
            child_in: DEFAULT_CHILD_IN_SLOT,
            child_out: DEFAULT_CHILD_OUT_SLOT,
        }
    }
}

impl HandleSlots {
    /// Check the slots are usable: beyond stdio and distinct.
    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.child_in <= 2 || self.child_out <= 2 {
            return Err(BrokerError::InvalidArgument {
                reason: "rpc handle slots must be above stderr (2)".to_string(),
            });
        }
        if self.child_in == self.child_out {
            return Err(BrokerError::InvalidArgument {
                reason: "rpc handle slots must be distinct".to_string(),
            });
        }
        Ok(())
    }
}

/// Broker-side ends of a child's RPC channels.
#[cfg(unix)]
#[derive(Debug)]
pub(crate) struct RpcChannels {
    /// Broker writes broker-to-child frames here
    pub inbound: pipe::Sender,
    /// Broker reads child-to-broker frames here
    pub outbound: pipe::Receiver,
}

/// A freshly spawned child and, for RPC variants, its channels.
#[derive(Debug)]
pub(crate) struct SpawnedChild {
    pub child: Child,
    pub pid: u32,
    #[cfg(unix)]
    pub rpc: Option<RpcChannels>,
}

/// Spawn `command` with `args`, wiring RPC pipes at `slots` when given.
///
/// Registration of the child id happens in the supervisor atomically with
/// this call; on failure nothing is retained.
pub(crate) fn spawn_child(
    command: &str,
    args: &[String],
    slots: Option<HandleSlots>,
) -> Result<SpawnedChild, BrokerError> {
    if command.is_empty() {
        return Err(BrokerError::SpawnFailure {
            command: String::new(),
            reason: "command must not be empty".to_string(),
        });
    }

    let mut cmd = Command::new(command);
    cmd.args(args);
    cmd.stdin(Stdio::null());
    // The supervision task owns the child; if it is dropped early the
    // child must not outlive the broker.
    cmd.kill_on_drop(true);

    match slots {
        None => {
            let child = cmd.spawn().map_err(|e| BrokerError::SpawnFailure {
                command: command.to_string(),
                reason: e.to_string(),
            })?;
            let pid = child_pid(command, &child)?;
            Ok(SpawnedChild {
                child,
                pid,
                #[cfg(unix)]
                rpc: None,
            })
        }
        Some(slots) => spawn_child_rpc(cmd, command, slots),
    }
}

#[cfg(unix)]
fn spawn_child_rpc(
    mut cmd: Command,
    command: &str,
    slots: HandleSlots,
) -> Result<SpawnedChild, BrokerError> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};

    slots.validate()?;

    let spawn_err = |reason: String| BrokerError::SpawnFailure {
        command: command.to_string(),
        reason,
    };

    // inbound: broker writes, child reads at child_in
    let (child_read, broker_write) = nix::unistd::pipe().map_err(|e| spawn_err(e.to_string()))?;
    // outbound: child writes at child_out, broker reads
    let (broker_read, child_write) = nix::unistd::pipe().map_err(|e| spawn_err(e.to_string()))?;

    let child_read_fd = child_read.as_raw_fd();
    let child_write_fd = child_write.as_raw_fd();
    let broker_write_fd = broker_write.as_raw_fd();
    let broker_read_fd = broker_read.as_raw_fd();
    let in_slot = slots.child_in;
    let out_slot = slots.child_out;

    // SAFETY: the closure runs post-fork in the child and only performs
    // async-signal-safe descriptor shuffling via raw libc calls.
    unsafe {
        cmd.pre_exec(move || {
            let fail = || std::io::Error::last_os_error();

            // Park both child ends above any slot they could collide
            // with, then land them on their final numbers.
            let tmp_in = libc::fcntl(child_read_fd, libc::F_DUPFD, 32);
            if tmp_in < 0 {
                return Err(fail());
            }
            let tmp_out = libc::fcntl(child_write_fd, libc::F_DUPFD, 32);
            if tmp_out < 0 {
                return Err(fail());
            }

            libc::close(child_read_fd);
            libc::close(child_write_fd);
            // The broker's ends must not leak into the child, or EOF
            // never reaches either side.
            libc::close(broker_write_fd);
            libc::close(broker_read_fd);

            if libc::dup2(tmp_in, in_slot) < 0 {
                return Err(fail());
            }
            if libc::dup2(tmp_out, out_slot) < 0 {
                return Err(fail());
            }
            libc::close(tmp_in);
            libc::close(tmp_out);
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|e| spawn_err(e.to_string()))?;
    let pid = child_pid(command, &child)?;

    // The child ends close here; the child holds its own copies.
    drop(child_read);
    drop(child_write);

    fcntl(&broker_write, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
        .map_err(|e| spawn_err(e.to_string()))?;
    fcntl(&broker_read, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
        .map_err(|e| spawn_err(e.to_string()))?;

    let inbound = pipe::Sender::from_owned_fd(broker_write).map_err(|e| spawn_err(e.to_string()))?;
    let outbound =
        pipe::Receiver::from_owned_fd(broker_read).map_err(|e| spawn_err(e.to_string()))?;

    Ok(SpawnedChild {
        child,
        pid,
        rpc: Some(RpcChannels { inbound, outbound }),
    })
}

#[cfg(not(unix))]
fn spawn_child_rpc(
    _cmd: Command,
    command: &str,
    _slots: HandleSlots,
) -> Result<SpawnedChild, BrokerError> {
    Err(BrokerError::SpawnFailure {
        command: command.to_string(),
        reason: "rpc handle wiring requires a unix host".to_string(),
    })
}

fn child_pid(command: &str, child: &Child) -> Result<u32, BrokerError> {
    child.id().ok_or_else(|| BrokerError::SpawnFailure {
        command: command.to_string(),
        reason: "child exited before a pid was observed".to_string(),
    })
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use procbus_wire::{Message, WireCodec, WireEncoding};
    use serde_json::Value;
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[test]
    fn test_slot_validation() {
        assert!(HandleSlots::default().validate().is_ok());
        assert!(HandleSlots {
            child_in: 1,
            child_out: 4
        }
        .validate()
        .is_err());
        assert!(HandleSlots {
            child_in: 5,
            child_out: 5
        }
        .validate()
        .is_err());
    }

    #[tokio::test]
    async fn test_spawn_plain_child() {
        let mut spawned = spawn_child("/bin/true", &[], None).unwrap();
        assert!(spawned.pid > 0);
        let status = spawned.child.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let result = spawn_child("/bin/definitely-not-here", &[], None);
        assert!(matches!(result, Err(BrokerError::SpawnFailure { .. })));
    }

    #[tokio::test]
    async fn test_spawn_empty_command_rejected() {
        let result = spawn_child("", &[], None);
        assert!(matches!(result, Err(BrokerError::SpawnFailure { .. })));
    }

    #[tokio::test]
    async fn test_rpc_child_loopback() {
        // The child copies its inbound handle to its outbound handle, so a
        // frame written by the broker comes straight back.
        let args = vec!["-c".to_string(), "exec cat <&3 >&4".to_string()];
        let mut spawned = spawn_child("/bin/sh", &args, Some(HandleSlots::default())).unwrap();
        let rpc = spawned.rpc.take().unwrap();

        let codec = WireCodec::new(WireEncoding::Json);
        let mut writer = FramedWrite::new(rpc.inbound, codec.clone());
        let mut reader = FramedRead::new(rpc.outbound, codec);

        let msg = Message::event("ping", "broker", "w1", Value::from(7));
        writer.send(msg.clone()).await.unwrap();

        let echoed = reader.next().await.unwrap().unwrap();
        assert_eq!(echoed, msg);

        drop(writer); // EOF ends the cat loop
        let status = spawned.child.wait().await.unwrap();
        assert!(status.success());
    }
}
