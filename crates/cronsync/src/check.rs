//! Check command: validate a catalog without scheduling it.

use std::path::Path;

use miette::Result;
use tracing::info;

use cronsync_scheduler::{
    CronDefinition, JobDefinition, JsonFileCatalog, Resolver, parse_schedule,
};

use crate::tasks;

/// Verdict on one enabled definition.
#[derive(Debug, PartialEq)]
pub struct JobCheck {
    pub id: String,
    pub job_type: String,
    pub crontab: String,
    /// Why the job cannot be scheduled, if it cannot.
    pub problem: Option<String>,
}

impl std::fmt::Display for JobCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.problem {
            None => write!(f, "ok      {} {} `{}`", self.id, self.job_type, self.crontab),
            Some(problem) => write!(
                f,
                "invalid {} {} `{}`: {}",
                self.id, self.job_type, self.crontab, problem
            ),
        }
    }
}

/// Check every enabled definition against `resolver` and the cron parser.
pub fn check_jobs(jobs: &[JobDefinition], resolver: &dyn Resolver) -> Vec<JobCheck> {
    jobs.iter()
        .filter(|job| job.enabled)
        .map(|job| {
            let problem = match resolver.resolve(job) {
                Err(e) => Some(e.to_string()),
                Ok(_) => parse_schedule(&CronDefinition::from_crontab(&job.crontab))
                    .err()
                    .map(|e| e.to_string()),
            };
            JobCheck {
                id: job.id.to_string(),
                job_type: job.job_type.to_string(),
                crontab: job.crontab.clone(),
                problem,
            }
        })
        .collect()
}

pub async fn run(path: &Path) -> Result<()> {
    let catalog = JsonFileCatalog::new(path);
    let jobs = catalog
        .load_all()
        .await
        .map_err(|e| miette::miette!("failed to read catalog {}: {}", path.display(), e))?;

    let registry = tasks::registry();
    let checks = check_jobs(&jobs, &registry);
    for check in &checks {
        println!("{}", check);
    }

    let invalid = checks.iter().filter(|check| check.problem.is_some()).count();
    info!(total = jobs.len(), enabled = checks.len(), invalid, "catalog checked");

    if invalid > 0 {
        return Err(miette::miette!(
            "{} of {} enabled jobs cannot be scheduled",
            invalid,
            checks.len()
        ));
    }
    Ok(())
}
