// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use serde::Deserialize;
use tracing::{debug, warn};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct CronJobConfig {
    pub id: String,
    /// Standard 5-field cron expression (a seconds field is also accepted)
    pub schedule: String,
    pub prompt: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub policy: Option<CronPolicy>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CronPolicy {
    /// Tool names (aliases accepted) visible to this job. Unset means the
    /// read-only default set.
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CronDoc {
    #[serde(default)]
    jobs: Vec<CronJobConfig>,
}

impl CronJobConfig {
    /// Parse the cron expression, accepting the conventional 5-field form
    /// by prepending a zero seconds field.
    pub fn parsed_schedule(&self) -> anyhow::Result<cron::Schedule> {
        let text = if self.schedule.split_whitespace().count() == 5 {
            format!("0 {}", self.schedule)
        } else {
            self.schedule.clone()
        };
        cron::Schedule::from_str(&text)
            .with_context(|| format!("job {}: invalid cron expression {:?}", self.id, self.schedule))
    }
}

/// Load every `jobs:` document in the cron directory. Broken files are
/// skipped with a warning; a job with an unparseable schedule is dropped
/// here so the service never has to deal with it.
pub fn load_cron_jobs(dir: &Path) -> anyhow::Result<Vec<CronJobConfig>> {
    let mut jobs = Vec::new();
    if !dir.is_dir() {
        return Ok(jobs);
    }
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    paths.sort();

    for path in paths {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let doc: CronDoc = match serde_yaml::from_str(&text) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping invalid cron document");
                continue;
            }
        };
        for job in doc.jobs {
            if let Err(e) = job.parsed_schedule() {
                warn!(job = %job.id, error = %e, "dropping job with invalid schedule");
                continue;
            }
            debug!(job = %job.id, schedule = %job.schedule, "loaded cron job");
            jobs.push(job);
        }
    }
    Ok(jobs)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
