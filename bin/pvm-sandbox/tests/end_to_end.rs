//! Runs programs through the real sandbox executable.

use std::{path::PathBuf, sync::Arc, time::Duration};

use pvm_executor::{
    ipc::{
        read_frame, write_frame, ErrorKind, ErrorPayload, HostCallRequest, IpcError, IpcMessage,
        MessageType,
    },
    pool::{ExhaustionPolicy, SandboxPool, SandboxPoolConfiguration},
    process::ChildProcessManager,
    test_utils::{add_program, echo_program, infinite_loop_program, sum_to_n_program},
    ExecutionMode, Executor, ExecutorConfig, ExecutorError, ExecutorKind, Gas, Invocation,
    SandboxError, SandboxedConfig, SandboxedFrontend, VmExecutionResult,
};
use rstest::rstest;

const SANDBOX: &str = env!("CARGO_BIN_EXE_pvm-sandbox");

fn sandboxed_config() -> SandboxedConfig {
    SandboxedConfig {
        executable: Some(PathBuf::from(SANDBOX)),
        spawn_grace: Duration::from_millis(20),
        ..Default::default()
    }
}

fn pool_config(pool_size: usize) -> SandboxPoolConfiguration {
    SandboxPoolConfiguration {
        pool_size,
        sandbox_path: Some(PathBuf::from(SANDBOX)),
        spawn_grace: Duration::from_millis(20),
        health_check_interval: Duration::ZERO,
        ..Default::default()
    }
}

async fn in_process(blob: &[u8], gas: u64, argument_data: Option<&[u8]>) -> VmExecutionResult {
    Executor::new(ExecutionMode::empty())
        .execute(blob, 0, Gas::new(gas), argument_data, None)
        .await
        .unwrap()
}

#[rstest]
#[case::add(add_program(), 1_000_000, None)]
#[case::loop_(sum_to_n_program(50), 1_000_000, None)]
#[case::out_of_gas(infinite_loop_program(), 500, None)]
#[case::echo(echo_program(), 10, Some(b"sandboxed".to_vec()))]
#[case::garbage(vec![0xff; 4], 100, None)]
#[tokio::test]
async fn test_sandboxed_matches_in_process(
    #[case] blob: Vec<u8>,
    #[case] gas: u64,
    #[case] argument_data: Option<Vec<u8>>,
) {
    let frontend = SandboxedFrontend::new(ExecutionMode::SANDBOXED, sandboxed_config());
    let invocation =
        Invocation { blob: &blob, pc: 0, gas: Gas::new(gas), argument_data: argument_data.as_deref() };

    // the sandbox itself must succeed, not the fallback
    let result = frontend.execute_in_sandbox(invocation).await.unwrap();
    assert_eq!(result, in_process(&blob, gas, argument_data.as_deref()).await);
    assert_eq!(frontend.manager().tracked_count(), 0);
}

#[tokio::test]
async fn test_executor_sandboxed_mode() {
    let executor = Executor::with_config(ExecutorConfig {
        mode: ExecutionMode::SANDBOXED,
        sandbox: sandboxed_config(),
        pool: None,
    });
    assert_eq!(executor.kind(), ExecutorKind::Sandboxed);
    let result = executor.execute(&add_program(), 0, Gas::new(1_000_000), None, None).await.unwrap();
    assert_eq!(result.final_registers[7], 142);
}

#[tokio::test]
async fn test_jit_request_is_reported_by_sandbox() {
    let frontend =
        SandboxedFrontend::new(ExecutionMode::SANDBOXED | ExecutionMode::JIT, sandboxed_config());
    let blob = add_program();
    let invocation = Invocation { blob: &blob, pc: 0, gas: Gas::new(100), argument_data: None };
    assert!(matches!(
        frontend.execute_in_sandbox(invocation).await,
        Err(SandboxError::Ipc(IpcError::ChildError(message))) if message.contains("JIT")
    ));
    assert_eq!(frontend.manager().tracked_count(), 0);
}

#[tokio::test]
async fn test_reserved_host_call_message_is_rejected() {
    let manager = ChildProcessManager::with_spawn_grace(Duration::from_millis(20));
    let (handle, stream) = manager.spawn(SANDBOX.as_ref()).await.unwrap();
    stream.set_nonblocking(true).unwrap();
    let mut stream = tokio::net::UnixStream::from_std(stream).unwrap();

    let request = HostCallRequest { call_index: 3, registers: [0; 13] };
    write_frame(&mut stream, &IpcMessage::new(9, &request)).await.unwrap();
    let reply = read_frame(&mut stream).await.unwrap().unwrap();
    assert_eq!(reply.message_type, MessageType::Error);
    assert_eq!(reply.request_id, 9);
    assert_eq!(reply.decode_payload::<ErrorPayload>().unwrap().kind, ErrorKind::Unknown);

    drop(stream);
    assert_eq!(manager.wait_for_exit(handle, Duration::from_secs(5)).await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_serves_concurrent_requests() {
    let executor = Arc::new(Executor::pooled(ExecutionMode::SANDBOXED, pool_config(2)));
    let expected = in_process(&sum_to_n_program(20), 1_000, None).await;

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let executor = executor.clone();
            tokio::spawn(async move {
                executor.execute(&sum_to_n_program(20), 0, Gas::new(1_000), None, None).await
            })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), expected);
    }

    let stats = executor.statistics().unwrap();
    assert_eq!(stats.total_executions, 8);
    assert_eq!(stats.successful_executions, 8);
    assert_eq!(stats.failed_executions, 0);
    // the pool is warmed with both workers before the first request
    assert_eq!(stats.workers_spawned, 2, "{stats:?}");
    assert_eq!(stats.active_workers, 0);
    assert!(stats.is_healthy());

    executor.shutdown().await;
    assert_eq!(executor.statistics().unwrap().total_workers, 0);
    assert_eq!(
        executor.execute(&add_program(), 0, Gas::new(100), None, None).await,
        Err(ExecutorError::PoolShutdown)
    );
}

#[tokio::test]
async fn test_workers_are_recycled() {
    let config = SandboxPoolConfiguration {
        worker_recycle_threshold: 2,
        ..pool_config(1)
    };
    let pool = SandboxPool::new(config, ExecutionMode::SANDBOXED).unwrap();
    let blob = add_program();
    for _ in 0..5 {
        let invocation = Invocation { blob: &blob, pc: 0, gas: Gas::new(100), argument_data: None };
        pool.execute(invocation).await.unwrap();
    }

    let stats = pool.statistics();
    assert_eq!(stats.workers_spawned, 3);
    assert_eq!(stats.workers_recycled, 2);
    assert_eq!(stats.idle_workers, 1);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_started_pool_serves_from_warm_workers() {
    let pool = SandboxPool::start(pool_config(2), ExecutionMode::SANDBOXED).await.unwrap();
    assert_eq!(pool.statistics().idle_workers, 2);

    let blob = add_program();
    let invocation = Invocation { blob: &blob, pc: 0, gas: Gas::new(100), argument_data: None };
    pool.execute(invocation).await.unwrap();

    let stats = pool.statistics();
    assert_eq!(stats.workers_spawned, 2);
    assert_eq!(stats.idle_workers, 2);
    assert_eq!(stats.utilization_rate(), 0.0);
    assert_eq!(stats.worker_failure_rate(), 0.0);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_health_check_keeps_responsive_workers() {
    let pool = SandboxPool::new(pool_config(1), ExecutionMode::SANDBOXED).unwrap();
    let blob = add_program();
    let invocation = Invocation { blob: &blob, pc: 0, gas: Gas::new(100), argument_data: None };
    pool.execute(invocation).await.unwrap();

    assert_eq!(pool.check_health().await, 0);
    assert_eq!(pool.statistics().idle_workers, 1);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_overflow_worker_is_torn_down() {
    let config = SandboxPoolConfiguration {
        exhaustion_policy: ExhaustionPolicy::SpawnOverflow,
        allow_overflow_workers: true,
        max_overflow_workers: 1,
        ..pool_config(1)
    };
    let pool = SandboxPool::new(config, ExecutionMode::SANDBOXED).unwrap();
    let slow = sum_to_n_program(200_000);
    let fast = add_program();

    let slow_run = pool.execute(Invocation {
        blob: &slow,
        pc: 0,
        gas: Gas::new(10_000_000),
        argument_data: None,
    });
    let fast_run = async {
        // let the slow request take the only regular worker first
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.execute(Invocation { blob: &fast, pc: 0, gas: Gas::new(100), argument_data: None })
            .await
    };
    let (slow_result, fast_result) = tokio::join!(slow_run, fast_run);
    slow_result.unwrap();
    fast_result.unwrap();

    let stats = pool.statistics();
    assert_eq!(stats.total_executions, 2);
    assert!(stats.overflow_executions <= 1);
    assert_eq!(stats.total_workers, 1);
    pool.shutdown().await;
}
