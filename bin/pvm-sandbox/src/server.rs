use std::{
    io,
    os::fd::{FromRawFd, OwnedFd},
};

use pvm_executor::{
    ipc::{ExecuteRequest, ExecuteResponse, IpcError, IpcServer, ServerExit},
    ExecutorError, InProcessFrontend,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::UnixStream,
};
use tracing::{debug, info};

use crate::{LimitError, SandboxArgs};

/// Errors that stop the worker.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The log file could not be created.
    #[error("failed to initialize logging: {0}")]
    Logging(#[source] io::Error),
    /// A resource limit could not be installed.
    #[error(transparent)]
    Limits(#[from] LimitError),
    /// Descriptor 0 is not a usable socket.
    #[error("failed to adopt the IPC channel: {0}")]
    Channel(#[source] io::Error),
    /// The async runtime could not be built.
    #[error("failed to start runtime: {0}")]
    Runtime(#[source] io::Error),
    /// The channel failed while serving.
    #[error(transparent)]
    Ipc(#[from] IpcError),
}

/// Runs one request with the in-process interpreter, whatever isolation the caller asked for.
pub fn handle(request: &ExecuteRequest) -> Result<ExecuteResponse, ExecutorError> {
    InProcessFrontend::new(request.mode)
        .execute(request.invocation(), None)
        .map(ExecuteResponse::from)
}

/// Serves requests on `stream` until the controller closes it.
pub async fn serve<S>(stream: S) -> Result<ServerExit, IpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut server = IpcServer::new(stream);
    let exit = server
        .serve(|request: ExecuteRequest| {
            debug!(target: "pvm::sandbox", pc = request.pc, gas = request.gas, "executing request");
            let outcome = handle(&request);
            async move { outcome }
        })
        .await;
    info!(target: "pvm::sandbox", served = server.served(), ?exit, "serve loop ended");
    exit
}

/// Adopts descriptor 0, the controller's channel, as a Unix stream.
///
/// Must be called at most once, from within a Tokio runtime.
pub fn stdin_channel() -> io::Result<UnixStream> {
    // SAFETY: descriptor 0 was installed by the controller and nothing else in this process
    // takes ownership of it.
    let fd = unsafe { OwnedFd::from_raw_fd(libc::STDIN_FILENO) };
    let stream = std::os::unix::net::UnixStream::from(fd);
    stream.set_nonblocking(true)?;
    UnixStream::from_std(stream)
}

/// The worker's whole lifetime: logging, limits, then the serve loop on a current-thread
/// runtime.
pub fn run(args: &SandboxArgs) -> Result<ServerExit, WorkerError> {
    args.log_args.init().map_err(WorkerError::Logging)?;
    args.limits().apply()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(WorkerError::Runtime)?;
    runtime.block_on(async {
        let stream = stdin_channel().map_err(WorkerError::Channel)?;
        debug!(target: "pvm::sandbox", pid = std::process::id(), "serving");
        Ok::<_, WorkerError>(serve(stream).await?)
    })
}

#[cfg(test)]
mod tests {
    use pvm_executor::{
        ipc::IpcClient,
        test_utils::{add_program, echo_program},
        ExecutionMode,
    };

    use super::*;

    fn request(blob: Vec<u8>, mode: ExecutionMode) -> ExecuteRequest {
        ExecuteRequest { blob, pc: 0, gas: 1_000, argument_data: Some(vec![1, 2, 3]), mode }
    }

    #[test]
    fn test_handle_ignores_sandbox_bit() {
        let response = handle(&request(echo_program(), ExecutionMode::SANDBOXED)).unwrap();
        assert_eq!(response.output_data, Some(vec![1, 2, 3]));
        assert_eq!(response.error_message, None);
    }

    #[test]
    fn test_handle_jit_fails() {
        let mode = ExecutionMode::SANDBOXED | ExecutionMode::JIT;
        assert_eq!(handle(&request(add_program(), mode)).unwrap_err(), ExecutorError::JitUnavailable);
    }

    #[tokio::test]
    async fn test_serve_until_closed() {
        let (controller, sandbox) = UnixStream::pair().unwrap();
        let worker = tokio::spawn(serve(sandbox));

        let mut client = IpcClient::new(controller);
        let response = client.execute(&request(add_program(), ExecutionMode::SANDBOXED)).await.unwrap();
        assert_eq!(response.final_registers[7], 142);
        drop(client);

        assert_eq!(worker.await.unwrap().unwrap(), ServerExit::PeerClosed);
    }
}
