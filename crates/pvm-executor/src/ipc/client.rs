use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::UnixStream,
};
use tracing::{trace, warn};

use crate::ipc::{
    read_frame, write_frame, ErrorPayload, ExecuteRequest, ExecuteResponse, Heartbeat, IpcError,
    IpcMessage, MessageType, Payload, WorkerStatus,
};

/// The controller end of a sandbox channel.
///
/// Every call takes `&mut self` and completes a full request/response round trip, so a channel
/// can never have more than one request in flight.
#[derive(Debug)]
pub struct IpcClient<S = UnixStream> {
    stream: S,
    next_request_id: u32,
}

impl IpcClient<UnixStream> {
    /// Adopts the controller end of a socket pair.
    ///
    /// Must be called from within a Tokio runtime. Failures are reported as
    /// [`IpcError::Channel`].
    pub fn from_std(stream: std::os::unix::net::UnixStream) -> Result<Self, IpcError> {
        stream.set_nonblocking(true).map_err(IpcError::Channel)?;
        UnixStream::from_std(stream).map(Self::new).map_err(IpcError::Channel)
    }
}

impl<S> IpcClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an already connected stream.
    pub const fn new(stream: S) -> Self {
        Self { stream, next_request_id: 1 }
    }

    /// The id the next request will carry.
    pub const fn next_request_id(&self) -> u32 {
        self.next_request_id
    }

    fn allocate_request_id(&mut self) -> u32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        id
    }

    /// Sends `message` and reads exactly one response frame.
    async fn round_trip(&mut self, message: IpcMessage) -> Result<IpcMessage, IpcError> {
        let request_id = message.request_id;
        trace!(target: "pvm::ipc", request_id, kind = ?message.message_type, "sending request");
        write_frame(&mut self.stream, &message).await?;

        let response = read_frame(&mut self.stream).await?.ok_or(IpcError::UnexpectedEof)?;
        if response.request_id != request_id {
            warn!(
                target: "pvm::ipc",
                expected = request_id,
                received = response.request_id,
                "response request id mismatch"
            );
        }
        if response.message_type == MessageType::Error {
            let error = response.decode_payload::<ErrorPayload>()?;
            return Err(IpcError::ChildError(format!("{}: {}", error.kind, error.message)));
        }
        Ok(response)
    }

    /// Runs one program in the sandbox.
    pub async fn execute(&mut self, request: &ExecuteRequest) -> Result<ExecuteResponse, IpcError> {
        let id = self.allocate_request_id();
        let response = self.round_trip(IpcMessage::new(id, request)).await?;
        let response = response.decode_payload::<ExecuteResponse>()?;
        if let Some(message) = response.error_message {
            return Err(IpcError::ChildError(message));
        }
        Ok(response)
    }

    /// Sends a heartbeat and waits for the echo.
    pub async fn heartbeat(&mut self) -> Result<Heartbeat, IpcError> {
        let id = self.allocate_request_id();
        let heartbeat = Heartbeat::now(WorkerStatus::Ready);
        self.round_trip(IpcMessage::new(id, &heartbeat)).await?.decode_payload::<Heartbeat>()
    }

    /// Gives up the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;
    use crate::{ipc::ErrorKind, ExecutionMode};

    fn request() -> ExecuteRequest {
        ExecuteRequest {
            blob: vec![0, 0, 0],
            pc: 0,
            gas: 10,
            argument_data: None,
            mode: ExecutionMode::empty(),
        }
    }

    #[tokio::test]
    async fn test_unpollable_descriptor_is_a_channel_error() {
        // regular files cannot be registered with epoll
        let file = tempfile::tempfile().unwrap();
        let stream = std::os::unix::net::UnixStream::from(std::os::fd::OwnedFd::from(file));
        assert!(matches!(IpcClient::from_std(stream), Err(IpcError::Channel(_))));
    }

    #[tokio::test]
    async fn test_request_ids_increase() {
        let (client_end, mut server_end) = duplex(1024);
        let mut client = IpcClient::new(client_end);

        let peer = tokio::spawn(async move {
            let mut ids = Vec::new();
            for _ in 0..2 {
                let message = read_frame(&mut server_end).await.unwrap().unwrap();
                ids.push(message.request_id);
                let echo = IpcMessage::new(message.request_id, &Heartbeat::now(WorkerStatus::Ready));
                write_frame(&mut server_end, &echo).await.unwrap();
            }
            ids
        });

        client.heartbeat().await.unwrap();
        client.heartbeat().await.unwrap();
        assert_eq!(peer.await.unwrap(), vec![1, 2]);
        assert_eq!(client.next_request_id(), 3);
    }

    #[tokio::test]
    async fn test_error_frame_is_child_error() {
        let (client_end, mut server_end) = duplex(1024);
        let mut client = IpcClient::new(client_end);

        tokio::spawn(async move {
            let message = read_frame(&mut server_end).await.unwrap().unwrap();
            let error = ErrorPayload::new(ErrorKind::Execution, "boom");
            write_frame(&mut server_end, &IpcMessage::new(message.request_id, &error)).await.unwrap();
        });

        let err = client.execute(&request()).await.unwrap_err();
        assert!(matches!(err, IpcError::ChildError(message) if message == "execution: boom"));
    }

    #[tokio::test]
    async fn test_mismatched_request_id_is_tolerated() {
        let (client_end, mut server_end) = duplex(1024);
        let mut client = IpcClient::new(client_end);

        tokio::spawn(async move {
            read_frame(&mut server_end).await.unwrap().unwrap();
            let echo = IpcMessage::new(999, &Heartbeat::now(WorkerStatus::Busy));
            write_frame(&mut server_end, &echo).await.unwrap();
        });

        assert_eq!(client.heartbeat().await.unwrap().status, WorkerStatus::Busy);
    }

    #[tokio::test]
    async fn test_closed_peer_is_eof() {
        let (client_end, mut server_end) = duplex(1024);
        let mut client = IpcClient::new(client_end);

        tokio::spawn(async move {
            read_frame(&mut server_end).await.unwrap().unwrap();
            drop(server_end);
        });

        assert!(matches!(client.execute(&request()).await, Err(IpcError::UnexpectedEof)));
    }
}
