//! A demo consumer binary: exercises the pool end-to-end against a toy flow that squares an
//! integer, rejecting negative input as a structured user error.

use std::time::Duration;

use clap::{Parser, ValueEnum};

use flow_worker_pool::context::OperationContextSnapshot;
use flow_worker_pool::errors::SerializedWorkerError;
use flow_worker_pool::executor::{Executor, ExecutorFactory};
use flow_worker_pool::manager::cold_spawn::ColdSpawnManager;
use flow_worker_pool::manager::fork::PreloadedForkManager;
use flow_worker_pool::pool::PoolContext;
use flow_worker_pool::single_shot::{self, SingleShotInvoker, SingleShotTarget};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Cold,
    Fork,
}

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, value_enum, default_value_t = Mode::Cold)]
    mode: Mode,

    #[arg(long, default_value_t = 2)]
    workers: usize,

    #[arg(long, value_delimiter = ',', default_value = "3,4,-1")]
    requests: Vec<i64>,
}

struct SquareExecutor;

impl Executor for SquareExecutor {
    type Request = i64;
    type Response = i64;

    fn execute(&mut self, request: i64) -> Result<i64, SerializedWorkerError> {
        if request == i64::MIN {
            std::process::exit(1);
        }
        if request < 0 {
            return Err(SerializedWorkerError::new(
                "UserError",
                "negative numbers are not supported",
            ));
        }
        Ok(request * request)
    }
}

struct SquareFactory;

impl ExecutorFactory for SquareFactory {
    type Storage = ();
    type Exec = SquareExecutor;

    fn create(&self, _storage: ()) -> SquareExecutor {
        SquareExecutor
    }
}

struct SumSingleShot;

impl SingleShotTarget for SumSingleShot {
    type Arg = Vec<i64>;
    type Output = i64;

    fn call(&self, arg: Vec<i64>) -> Result<i64, SerializedWorkerError> {
        Ok(arg.into_iter().sum())
    }
}

#[tokio::main]
async fn main() {
    let factory = SquareFactory;

    if flow_worker_pool::dispatch_role(
        &factory,
        || (),
        None,
        OperationContextSnapshot::new(),
    ) {
        return;
    }
    if single_shot::dispatch_single_shot_role(&SumSingleShot) {
        return;
    }

    flow_worker_pool::logging::init_default_subscriber();

    let args = Args::parse();

    match args.mode {
        Mode::Cold => run_cold(&args),
        Mode::Fork => run_fork(&args),
    }

    let invoker = SingleShotInvoker::new().expect("locate current binary");
    match invoker
        .invoke::<SumSingleShot>(
            "sum-demo",
            args.requests.clone(),
            OperationContextSnapshot::new(),
            None,
            Some(Duration::from_secs(5)),
        )
        .await
    {
        Ok(sum) => println!("single-shot sum: {sum}"),
        Err(err) => println!("single-shot failed: {err}"),
    }
}

fn run_cold(args: &Args) {
    let manager: ColdSpawnManager<i64, i64> =
        ColdSpawnManager::new(args.workers).expect("locate current binary");
    let pool = PoolContext::new(manager, None, OperationContextSnapshot::new());
    run_pool(&pool, args);
}

fn run_fork(args: &Args) {
    let manager: PreloadedForkManager<i64, i64> =
        PreloadedForkManager::new(args.workers).expect("locate current binary");
    let pool = PoolContext::new(manager, None, OperationContextSnapshot::new());
    run_pool(&pool, args);
}

fn run_pool<M>(pool: &PoolContext<M, i64, i64>, args: &Args)
where
    M: flow_worker_pool::manager::ProcessManager + flow_worker_pool::manager::PoolQueues<i64, i64>,
{
    pool.start().expect("start worker processes");

    for (i, &request) in args.requests.iter().enumerate() {
        let index = i % args.workers;
        pool.submit(index, request).expect("submit request");
    }

    for index in 0..args.workers {
        let Some(receiver) = pool.results(index) else {
            continue;
        };
        while let Ok(outcome) = receiver.recv_timeout(Duration::from_secs(5)) {
            println!("worker {index}: {outcome:?}");
        }
        pool.end(index).expect("end worker");
    }
}
