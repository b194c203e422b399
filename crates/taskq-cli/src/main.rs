use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use taskq_core::impls::JsonFileStore;
use taskq_core::typed::{Handler, Payload};
use taskq_core::{Queue, QueueConfig, Task, TaskBuilder, TaskError};

mod cli;
mod logging;

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    name: String,
    step: u32,
}

impl Payload for Hello {
    const TYPE: &'static str = "demo.hello.v1";
}

/// Fails the first `remaining_failures` attempts it sees, then greets.
struct HelloHandler {
    remaining_failures: AtomicU32,
}

impl HelloHandler {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl Handler<Hello> for HelloHandler {
    async fn handle(&self, task: &Task, payload: Hello) -> Result<(), TaskError> {
        let left = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if let Ok(left) = left {
            return Err(TaskError::failed(format!(
                "intentional failure (left={left})"
            )));
        }

        println!(
            "Hello, {}! (step {}, task {}, retries {})",
            payload.name,
            payload.step,
            task.id(),
            task.retry_count()
        );
        Ok(())
    }
}

fn load_config(args: &cli::CliArgs) -> Result<QueueConfig> {
    match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            Ok(QueueConfig::from_json(&raw)?)
        }
        None => Ok(QueueConfig::new("demo")),
    }
}

#[tokio::main]
async fn main() {
    if let Err(err) = run_main().await {
        eprintln!("taskq-cli error: {err:?}");
        std::process::exit(1);
    }
}

async fn run_main() -> Result<()> {
    let args = cli::parse();
    logging::init_logging(args.log_level)?;
    let config = load_config(&args)?;
    tracing::debug!(
        queue = %config.name,
        max_concurrency = config.max_concurrency,
        max_retries = config.max_retries,
        "queue configured"
    );

    let (tx, mut outcomes) = mpsc::unbounded_channel();
    let queue = Queue::builder(config)
        .persistence(Arc::new(JsonFileStore::new(&args.state_dir)))
        .on_complete(move |err, task| {
            let _ = tx.send((task.id().clone(), task.retry_count(), err.cloned()));
        })
        .register::<Hello, _>(HelloHandler::new(args.failures))?
        .expect_task_types(&[Hello::TYPE])
        .build()?;

    // Tasks left over from an interrupted run come back first.
    let restored = queue.load_persisted_tasks()?;
    if restored > 0 {
        println!("restored {restored} task(s) from {}", args.state_dir.display());
    }

    let mut previous: Option<Task> = None;
    let mut submitted = 0;
    for step in 1..=args.tasks {
        let mut builder = TaskBuilder::typed(&Hello {
            name: queue.name().to_string(),
            step,
        })?;
        if let Some(prev) = &previous {
            builder = builder.depends_on(prev.id().clone());
        }
        let task = builder.build();
        if queue.add_task(task.clone()).is_admitted() {
            submitted += 1;
        }
        previous = Some(task);
    }
    println!("submitted {submitted} task(s) to queue {}", queue.name());

    let expected = restored + submitted;
    for _ in 0..expected {
        let Some((id, retries, err)) = outcomes.recv().await else {
            break;
        };
        match err {
            None => println!("finished: id={id} retries={retries}"),
            Some(e) => println!("cancelled: id={id} retries={retries} error={e}"),
        }
    }

    println!("pending: {}", queue.len());
    Ok(())
}
