//! Command-line front end for the browsing agent.
//!
//! Runs one task against an in-memory page, or against a native browser
//! driver when `--driver` names one.

use std::sync::Arc;

use agent_core::{AgentRuntime, MemoryPage, NativeDriverConfig, StdioDriver};
use ai_agent::{AgentConfig, AgentEvent, EventSink, DEFAULT_AGENT_MAX_ITERATIONS, DEFAULT_MODEL};
use anyhow::{Context, Result};
use clap::Parser;
use llm_router::LlmRouter;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Command-line arguments for the browsing agent
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Task for the agent, in plain language
    #[arg(required = true)]
    task: String,

    /// Native driver executable (embedded DOM mode when absent)
    #[arg(long)]
    driver: Option<String>,

    /// Extra argument for the driver, repeatable
    #[arg(long = "driver-arg")]
    driver_args: Vec<String>,

    /// Ask the native driver to run without a window
    #[arg(long, default_value_t = false)]
    headless: bool,

    /// Model requested from the reasoning service
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,

    /// Reasoning turns before the run gives up
    #[arg(long, default_value_t = DEFAULT_AGENT_MAX_ITERATIONS)]
    max_iterations: usize,

    /// Milliseconds to wait after page-changing tools
    #[arg(long, default_value_t = 1_000)]
    settle_ms: u64,

    /// Enable debug logging
    #[arg(short, long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug {
        "debug"
    } else {
        "info,agent_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    fmt().with_env_filter(filter).with_target(true).init();

    let router = LlmRouter::from_env().context("configuring reasoning service")?;
    info!(mode = ?router.auth_mode(), endpoint = router.endpoint(), "reasoning service ready");

    let config = AgentConfig {
        model: args.model.clone(),
        max_iterations: args.max_iterations,
        post_action_delay_ms: args.settle_ms,
        ..AgentConfig::default()
    };
    let page = Arc::new(MemoryPage::new().with_tab(agent_core::page::NEW_TAB_URL));
    let mut builder = AgentRuntime::builder(router.route())
        .with_config(config)
        .with_page_context(page);
    if let Some(program) = &args.driver {
        let mut driver_config = NativeDriverConfig::new(program.clone());
        driver_config.args = args.driver_args.clone();
        driver_config.headless = args.headless;
        builder = builder.with_native_driver(Arc::new(StdioDriver::new(driver_config)), args.headless);
    }
    let runtime = Arc::new(builder.build());

    let (sink, mut events) = EventSink::channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    let run = {
        let runtime = runtime.clone();
        let task = args.task.clone();
        tokio::spawn(async move { runtime.run_with_events(&task, sink).await })
    };
    let interrupt = {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping run");
                runtime.stop();
            }
        })
    };

    let result = run.await.context("agent run panicked")?;
    interrupt.abort();
    let _ = printer.await;

    if let Err(err) = runtime.shutdown().await {
        warn!(error = %format!("{err:#}"), "native session did not stop cleanly");
    }

    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}

fn print_event(event: &AgentEvent) {
    match event {
        AgentEvent::Thinking { text } => println!("· {text}"),
        AgentEvent::ToolCall { name, input, .. } => println!("→ {name} {input}"),
        AgentEvent::ToolResult { name, result, .. } => match result.error_message() {
            Some(error) => println!("✗ {name}: {error}"),
            None => println!("✓ {name}"),
        },
        AgentEvent::Completed { summary, .. } => println!("done: {summary}"),
        AgentEvent::Error { message } => eprintln!("error: {message}"),
    }
}
