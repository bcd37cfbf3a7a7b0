//! The child's end of the RPC channels.

// Layer 1: Standard library imports
use std::collections::VecDeque;
#[cfg(unix)]
use std::os::fd::{FromRawFd, OwnedFd};
use std::time::Duration;

// Layer 2: Third-party crate imports
use futures::{SinkExt, StreamExt};
#[cfg(unix)]
use tokio::net::unix::pipe;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

// Layer 3: Internal module imports
use crate::error::EndpointError;
use procbus_wire::rpc::{DEFAULT_CHILD_IN_SLOT, DEFAULT_CHILD_OUT_SLOT, INVALID_RPC_HANDLE_EXIT};
use procbus_wire::{Message, MessageKind, WireCodec, WireEncoding};

/// The descriptor slots this child inherited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointSlots {
    /// Slot carrying broker-to-child frames
    pub inbound: i32,
    /// Slot carrying child-to-broker frames
    pub outbound: i32,
}

impl Default for EndpointSlots {
    fn default() -> Self {
        Self {
            inbound: DEFAULT_CHILD_IN_SLOT,
            outbound: DEFAULT_CHILD_OUT_SLOT,
        }
    }
}

/// Framed connection from a child to its broker.
///
/// Wraps the two inherited pipe descriptors with the wire codec and
/// provides send/receive plus a correlated request helper. Responses that
/// arrive while a different request is awaited are buffered and handed
/// out by later [`ChildEndpoint::recv`] calls, so no frame is lost.
pub struct ChildEndpoint {
    id: String,
    reader: FramedRead<pipe::Receiver, WireCodec>,
    writer: FramedWrite<pipe::Sender, WireCodec>,
    backlog: VecDeque<Message>,
    seq: u64,
}

impl ChildEndpoint {
    /// Probe one inherited slot for validity.
    #[cfg(unix)]
    pub fn probe_slot(slot: i32) -> Result<(), EndpointError> {
        use std::os::fd::BorrowedFd;
        // SAFETY: the fd is only borrowed for the duration of the fcntl
        // probe and never closed here.
        let fd = unsafe { BorrowedFd::borrow_raw(slot) };
        nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_GETFD)
            .map(|_| ())
            .map_err(|_| EndpointError::InvalidHandle { slot })
    }

    /// Take ownership of the inherited slots with JSON framing.
    ///
    /// Both slots are probed first; an invalid slot is returned as
    /// [`EndpointError::InvalidHandle`] and MUST drive the child to exit
    /// with code 254.
    #[cfg(unix)]
    pub fn inherit(id: impl Into<String>) -> Result<Self, EndpointError> {
        Self::inherit_with(id, EndpointSlots::default(), WireEncoding::default())
    }

    /// Take ownership of explicit slots with an explicit encoding.
    #[cfg(unix)]
    pub fn inherit_with(
        id: impl Into<String>,
        slots: EndpointSlots,
        encoding: WireEncoding,
    ) -> Result<Self, EndpointError> {
        Self::probe_slot(slots.inbound)?;
        Self::probe_slot(slots.outbound)?;

        set_nonblocking(slots.inbound)?;
        set_nonblocking(slots.outbound)?;

        // SAFETY: the invocation contract reserves these slots for this
        // endpoint exclusively; nothing else in the process owns them.
        let inbound = unsafe { OwnedFd::from_raw_fd(slots.inbound) };
        let outbound = unsafe { OwnedFd::from_raw_fd(slots.outbound) };

        let receiver = pipe::Receiver::from_owned_fd(inbound)?;
        let sender = pipe::Sender::from_owned_fd(outbound)?;

        let codec = WireCodec::new(encoding);
        let id = id.into();
        debug!(id = %id, ?slots, encoding = %encoding, "rpc endpoint inherited");
        Ok(Self {
            id,
            reader: FramedRead::new(receiver, codec.clone()),
            writer: FramedWrite::new(sender, codec),
            backlog: VecDeque::new(),
            seq: 0,
        })
    }

    /// [`ChildEndpoint::inherit`], terminating the process with exit code
    /// 254 when a slot is invalid. This is the invocation contract every
    /// RPC child must follow before doing any work.
    #[cfg(unix)]
    pub fn inherit_or_exit(id: impl Into<String>) -> Self {
        match Self::inherit(id) {
            Ok(endpoint) => endpoint,
            Err(err) => {
                eprintln!("procbus-child: {err}");
                std::process::exit(INVALID_RPC_HANDLE_EXIT);
            }
        }
    }

    /// This child's id, used as the message source.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Send one message to the broker side.
    pub async fn send(&mut self, msg: Message) -> Result<(), EndpointError> {
        self.writer.send(msg).await?;
        Ok(())
    }

    /// Receive the next message; `None` when the broker closed the
    /// channel. Buffered frames are returned before the wire is read.
    pub async fn recv(&mut self) -> Result<Option<Message>, EndpointError> {
        if let Some(msg) = self.backlog.pop_front() {
            return Ok(Some(msg));
        }
        match self.reader.next().await {
            Some(Ok(msg)) => Ok(Some(msg)),
            Some(Err(err)) => Err(err.into()),
            None => Ok(None),
        }
    }

    /// Send a request and await its correlated response.
    ///
    /// Frames that are not the awaited response are buffered for later
    /// [`ChildEndpoint::recv`] calls.
    pub async fn request(
        &mut self,
        target: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<Message, EndpointError> {
        self.seq += 1;
        let request_id = format!("{}-{}", self.id, self.seq);
        let msg = Message::request(request_id.clone(), self.id.clone(), target, payload);
        self.send(msg).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let frame = tokio::time::timeout_at(deadline, self.reader.next())
                .await
                .map_err(|_| EndpointError::Timeout { timeout })?;

            match frame {
                Some(Ok(msg)) => {
                    let correlated = matches!(msg.kind, MessageKind::Response | MessageKind::Error)
                        && msg.correlation_id.as_deref() == Some(request_id.as_str());
                    if correlated {
                        return Ok(msg);
                    }
                    debug!(id = %msg.id, "frame buffered while awaiting response");
                    self.backlog.push_back(msg);
                }
                Some(Err(err)) => return Err(err.into()),
                None => {
                    warn!(request = %request_id, "channel closed while awaiting response");
                    return Err(EndpointError::Closed);
                }
            }
        }
    }
}

#[cfg(unix)]
fn set_nonblocking(slot: i32) -> Result<(), EndpointError> {
    use std::os::fd::BorrowedFd;
    // SAFETY: borrowed only for the fcntl calls below.
    let fd = unsafe { BorrowedFd::borrow_raw(slot) };
    nix::fcntl::fcntl(
        fd,
        nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
    )
    .map(|_| ())
    .map_err(|_| EndpointError::InvalidHandle { slot })
}
