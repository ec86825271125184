use pvm_executor::{
    constants::ipc::MAX_MESSAGE_SIZE,
    ipc::{
        read_frame, ExecuteRequest, ExecuteResponse, IpcClient, IpcError, IpcServer, ServerExit,
    },
    test_utils::{add_program, echo_program},
    ExecutionMode, InProcessFrontend,
};
use tokio::{io::AsyncWriteExt, net::UnixStream};

/// Serves `stream` the way the sandbox binary does.
async fn serve(stream: UnixStream) -> (ServerExit, u64) {
    let frontend = InProcessFrontend::new(ExecutionMode::empty());
    let mut server = IpcServer::new(stream);
    let exit = server
        .serve(|request: ExecuteRequest| {
            let outcome =
                frontend.execute(request.invocation(), None).map(ExecuteResponse::from);
            async move { outcome }
        })
        .await
        .unwrap();
    (exit, server.served())
}

#[tokio::test]
async fn test_execute_over_socket_pair() {
    let (controller, sandbox) = UnixStream::pair().unwrap();
    let server = tokio::spawn(serve(sandbox));
    let mut client = IpcClient::new(controller);

    let blob = add_program();
    let request = ExecuteRequest {
        blob: blob.clone(),
        pc: 0,
        gas: 1_000,
        argument_data: None,
        mode: ExecutionMode::SANDBOXED,
    };
    let remote = client.execute(&request).await.unwrap().into_result();
    let local = InProcessFrontend::new(ExecutionMode::empty())
        .execute(request.invocation(), None)
        .unwrap();
    assert_eq!(remote, local);

    let echo = ExecuteRequest {
        blob: echo_program(),
        pc: 0,
        gas: 10,
        argument_data: Some(b"ping".to_vec()),
        mode: ExecutionMode::SANDBOXED,
    };
    let response = client.execute(&echo).await.unwrap();
    assert_eq!(response.output_data.as_deref(), Some(&b"ping"[..]));
    assert_eq!(client.next_request_id(), 3);

    drop(client);
    assert_eq!(server.await.unwrap(), (ServerExit::PeerClosed, 2));
}

#[tokio::test]
async fn test_oversized_frame_is_rejected() {
    let (mut writer, mut reader) = UnixStream::pair().unwrap();
    writer.write_all(&MAX_MESSAGE_SIZE.to_le_bytes()).await.unwrap();
    assert!(matches!(
        read_frame(&mut reader).await,
        Err(IpcError::MalformedFrame { length }) if length == MAX_MESSAGE_SIZE
    ));
}

#[tokio::test]
async fn test_truncated_frame_is_unexpected_eof() {
    let (mut writer, mut reader) = UnixStream::pair().unwrap();
    writer.write_all(&[10, 0, 0, 0, 1, 1]).await.unwrap();
    drop(writer);
    assert!(matches!(read_frame(&mut reader).await, Err(IpcError::UnexpectedEof)));
}

#[tokio::test]
async fn test_heartbeat_round_trip() {
    let (controller, sandbox) = UnixStream::pair().unwrap();
    tokio::spawn(serve(sandbox));
    let mut client = IpcClient::new(controller);
    client.heartbeat().await.unwrap();
    client.heartbeat().await.unwrap();
}
