//! Stock worker binary. The executor launches one of these per job run.

use std::process::ExitCode;
use std::time::Duration;

use serde_json::{json, Value};
use workcell_executor::worker::{run_worker, FunctionTable, JobCall, JobFailure};

fn builtin_functions() -> FunctionTable {
    FunctionTable::new()
        .register("answer", |_| Ok(json!(42)))
        .register("echo", echo)
        .register("add", add)
        .register("sleep", sleep)
        .register("fail", |call| {
            let message = call
                .kwarg("message")
                .and_then(Value::as_str)
                .unwrap_or("boom");
            Err(JobFailure::new("ValueError", message).into())
        })
        .register("panic", |_| panic!("job panicked on purpose"))
}

fn echo(call: &JobCall) -> anyhow::Result<Value> {
    Ok(json!({
        "job_id": call.job_id,
        "instance_id": call.instance_id,
        "run_time": call.run_time,
        "args": call.args,
        "kwargs": call.kwargs,
    }))
}

fn add(call: &JobCall) -> anyhow::Result<Value> {
    let mut total = 0.0;
    for (i, arg) in call.args.iter().enumerate() {
        total += arg
            .as_f64()
            .ok_or_else(|| JobFailure::new("TypeError", format!("argument {i} is not a number")))?;
    }
    Ok(json!(total))
}

fn sleep(call: &JobCall) -> anyhow::Result<Value> {
    let secs = call.kwarg("secs").and_then(Value::as_f64).unwrap_or(1.0);
    std::thread::sleep(Duration::from_secs_f64(secs.max(0.0)));
    Ok(json!(secs))
}

#[tokio::main]
async fn main() -> ExitCode {
    // stderr is usually discarded by the executor; useful when run by hand.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "workcell_executor=warn".into()),
        )
        .init();

    match run_worker(&builtin_functions()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("worker failed: {e}");
            ExitCode::FAILURE
        }
    }
}
