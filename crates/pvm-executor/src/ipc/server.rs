use core::{fmt::Display, future::Future};

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace, warn};

use crate::ipc::{
    read_frame, write_frame, ErrorKind, ErrorPayload, ExecuteRequest, ExecuteResponse, IpcError,
    IpcMessage, MessageType,
};

/// Why a serve loop ended without an I/O failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerExit {
    /// The controller closed its end of the channel.
    PeerClosed,
    /// The controller sent an error frame.
    PeerError(String),
}

/// The sandbox end of a channel.
#[derive(Debug)]
pub struct IpcServer<S> {
    stream: S,
    served: u64,
}

impl<S> IpcServer<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Serves requests arriving on `stream`, the only transport of the sandbox.
    pub const fn new(stream: S) -> Self {
        Self { stream, served: 0 }
    }

    /// Number of execute requests answered so far.
    pub const fn served(&self) -> u64 {
        self.served
    }

    async fn send_error(
        &mut self,
        request_id: u32,
        kind: ErrorKind,
        message: String,
    ) -> Result<(), IpcError> {
        debug!(target: "pvm::ipc", request_id, %kind, %message, "answering with error frame");
        let payload = ErrorPayload::new(kind, message);
        write_frame(&mut self.stream, &IpcMessage::new(request_id, &payload)).await
    }

    /// Runs the serve loop.
    ///
    /// Each execute request is passed to `handler`. A handler failure or an undecodable message
    /// is answered with an error frame and the loop keeps going. Heartbeats are echoed.
    ///
    /// # Returns
    ///
    /// How the loop ended, or the I/O error that ended it.
    pub async fn serve<F, Fut, E>(&mut self, mut handler: F) -> Result<ServerExit, IpcError>
    where
        F: FnMut(ExecuteRequest) -> Fut,
        Fut: Future<Output = Result<ExecuteResponse, E>>,
        E: Display,
    {
        loop {
            let message = match read_frame(&mut self.stream).await {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(ServerExit::PeerClosed),
                Err(IpcError::Decode(err)) => {
                    self.send_error(0, ErrorKind::Deserialization, err.to_string()).await?;
                    continue;
                }
                Err(err) => return Err(err),
            };
            let request_id = message.request_id;
            trace!(target: "pvm::ipc", request_id, kind = ?message.message_type, "received message");

            match message.message_type {
                MessageType::ExecuteRequest => {
                    let request = match message.decode_payload::<ExecuteRequest>() {
                        Ok(request) => request,
                        Err(err) => {
                            self.send_error(request_id, ErrorKind::Deserialization, err.to_string())
                                .await?;
                            continue;
                        }
                    };
                    match handler(request).await {
                        Ok(response) => {
                            let reply = IpcMessage::new(request_id, &response);
                            write_frame(&mut self.stream, &reply).await?;
                        }
                        Err(err) => {
                            self.send_error(request_id, ErrorKind::Execution, err.to_string())
                                .await?;
                        }
                    }
                    self.served += 1;
                }
                MessageType::Heartbeat => write_frame(&mut self.stream, &message).await?,
                MessageType::Error => {
                    let reason = message
                        .decode_payload::<ErrorPayload>()
                        .map_or_else(|err| err.to_string(), |error| error.message);
                    warn!(target: "pvm::ipc", request_id, %reason, "peer reported an error");
                    return Ok(ServerExit::PeerError(reason));
                }
                other @ (MessageType::ExecuteResponse |
                MessageType::HostCallRequest |
                MessageType::HostCallResponse) => {
                    self.send_error(request_id, ErrorKind::Unknown, format!("unexpected {other:?}"))
                        .await?;
                }
            }
        }
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
    use crate::{
        ipc::{Heartbeat, IpcClient, WorkerStatus},
        ExecutionMode,
    };

    fn request(gas: u64) -> ExecuteRequest {
        ExecuteRequest { blob: vec![], pc: 0, gas, argument_data: None, mode: ExecutionMode::empty() }
    }

    fn response(gas_used: u64) -> ExecuteResponse {
        ExecuteResponse {
            exit_reason_code: 0,
            gas_used,
            output_data: None,
            error_message: None,
            final_registers: [0; 13],
            final_pc: 0,
        }
    }

    #[tokio::test]
    async fn test_handler_failure_keeps_loop_running() {
        let (client_end, server_end) = duplex(4096);
        let server = tokio::spawn(async move {
            let mut server = IpcServer::new(server_end);
            let exit = server
                .serve(|request: ExecuteRequest| async move {
                    if request.gas == 0 {
                        Err("no gas")
                    } else {
                        Ok(response(request.gas / 2))
                    }
                })
                .await
                .unwrap();
            (exit, server.served())
        });

        let mut client = IpcClient::new(client_end);
        assert!(matches!(
            client.execute(&request(0)).await,
            Err(IpcError::ChildError(message)) if message == "execution: no gas"
        ));
        assert_eq!(client.execute(&request(10)).await.unwrap().gas_used, 5);
        assert_eq!(client.heartbeat().await.unwrap().status, WorkerStatus::Ready);
        drop(client);

        assert_eq!(server.await.unwrap(), (ServerExit::PeerClosed, 2));
    }

    #[tokio::test]
    async fn test_error_frame_ends_loop() {
        let (mut client_end, server_end) = duplex(4096);
        let server = tokio::spawn(async move {
            IpcServer::new(server_end)
                .serve(|_| async { Ok::<_, String>(response(0)) })
                .await
                .unwrap()
        });

        let error = ErrorPayload::new(ErrorKind::Unknown, "shutting down");
        write_frame(&mut client_end, &IpcMessage::new(1, &error)).await.unwrap();
        assert_eq!(server.await.unwrap(), ServerExit::PeerError("shutting down".to_string()));
    }

    #[tokio::test]
    async fn test_undecodable_body_is_answered() {
        let (mut client_end, server_end) = duplex(4096);
        tokio::spawn(async move {
            IpcServer::new(server_end).serve(|_| async { Ok::<_, String>(response(0)) }).await
        });

        // a frame with an unknown message type
        let frame = [6, 0, 0, 0, 42, 1, 0, 0, 0, 0];
        tokio::io::AsyncWriteExt::write_all(&mut client_end, &frame).await.unwrap();
        let reply = read_frame(&mut client_end).await.unwrap().unwrap();
        assert_eq!(reply.message_type, MessageType::Error);
        assert_eq!(reply.request_id, 0);

        let echo = IpcMessage::new(5, &Heartbeat::now(WorkerStatus::Ready));
        write_frame(&mut client_end, &echo).await.unwrap();
        assert_eq!(read_frame(&mut client_end).await.unwrap().unwrap(), echo);
    }
}
