use anyhow::Result;
use errand::actions;
use errand::agent::{Agent, JsonRunSink, Task};
use errand::browser::{BrowserDriver, CdpConfig, CdpDriver, NullDriver, SharedDriver};
use errand::planner::{HttpPlanner, PlannerConfig};
use errand::registry::ActionRegistry;
use errand::store::{CsvLog, DocStore};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let driver: Arc<dyn BrowserDriver> = if std::env::var("ERRAND_DRY_RUN").is_ok() {
        Arc::new(NullDriver)
    } else if let Ok(ws) = std::env::var("CHROME_WS_URL") {
        Arc::new(SharedDriver::new(CdpDriver::connect(&ws).await?))
    } else {
        Arc::new(SharedDriver::new(
            CdpDriver::launch(CdpConfig { headless: false, user_agent: None }).await?,
        ))
    };

    let store = Arc::new(DocStore::new());
    let mut registry = ActionRegistry::with_browser(driver);
    actions::register_browser_actions(&mut registry)?;
    actions::register_job_actions(
        &mut registry,
        CsvLog::new("jobs.csv", actions::JOB_CSV_HEADER),
        "resume.txt",
    )?;
    actions::register_calendar_actions(&mut registry, store.clone(), "content_calendar.json")?;
    actions::register_docs_actions(
        &mut registry,
        store.clone(),
        "docs_library.json",
        "reference_guide.md",
    )?;
    actions::register_report_action(&mut registry, "report.md")?;
    let registry = Arc::new(registry);

    let planner = HttpPlanner::new(PlannerConfig::default(), registry.catalog())?;
    let runs_dir = std::env::temp_dir().join("errand_runs");
    let agent = Agent::new(planner, registry).with_run_sink(Arc::new(JsonRunSink::new(runs_dir)));

    let goal = std::env::args().nth(1).unwrap_or_else(|| {
        "Go to https://careers.example.com, search for systems engineering roles, \
         and save each relevant listing with a fit score."
            .to_string()
    });

    match agent.run(&Task::new(goal, 50)).await {
        Ok(report) => {
            if let Some(text) = &report.report {
                println!("{}", text);
            }
            println!(
                "run {} finished: {:?} after {} steps",
                report.run_id, report.status, report.metrics.steps
            );
            Ok(ExitCode::from(report.exit_code()))
        }
        Err(err) => {
            eprintln!("fatal: {}", err);
            Ok(ExitCode::from(1))
        }
    }
}
