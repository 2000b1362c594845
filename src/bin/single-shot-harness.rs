//! A small coordinator used by the integration tests to exercise `SingleShotInvoker`'s end-to-end
//! scenarios (normal completion, timeout, structured exception, unexpected exit).

use std::time::Duration;

use clap::Parser;

use flow_worker_pool::context::OperationContextSnapshot;
use flow_worker_pool::errors::SerializedWorkerError;
use flow_worker_pool::single_shot::{self, SingleShotInvoker, SingleShotTarget};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct HarnessArg {
    mode: String,
    input: i64,
    sleep_secs: u64,
}

struct HarnessTarget;

impl SingleShotTarget for HarnessTarget {
    type Arg = HarnessArg;
    type Output = i64;

    fn call(&self, arg: HarnessArg) -> Result<i64, SerializedWorkerError> {
        match arg.mode.as_str() {
            "sleep" => {
                std::thread::sleep(Duration::from_secs(arg.sleep_secs));
                Ok(arg.input)
            }
            "exception" => Err(SerializedWorkerError::new("UserError", "Test exception")),
            "exit" => std::process::exit(1),
            other => panic!("unknown harness mode {other}"),
        }
    }
}

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    mode: String,
    #[arg(long, default_value_t = 0)]
    input: i64,
    #[arg(long, default_value_t = 0)]
    sleep_secs: u64,
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[tokio::main]
async fn main() {
    if single_shot::dispatch_single_shot_role(&HarnessTarget) {
        return;
    }

    let args = Args::parse();
    let invoker = SingleShotInvoker::new().expect("locate current binary");
    let mut context = OperationContextSnapshot::new();
    context.insert("context_test_key".to_string(), "test_value".to_string());

    let result = invoker
        .invoke::<HarnessTarget>(
            "single-shot-harness",
            HarnessArg {
                mode: args.mode,
                input: args.input,
                sleep_secs: args.sleep_secs,
            },
            context,
            None,
            args.timeout_secs.map(Duration::from_secs),
        )
        .await;

    match result {
        Ok(value) => println!("RESULT:{value}"),
        Err(err) => println!("ERROR:{err}"),
    }
}
