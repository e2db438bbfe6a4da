use std::path::PathBuf;

use stagehand_pipeline::RunOptions;

pub const USAGE: &str = "usage: stagehand-worker <job.json> [--force] [--rerun-failed] [--plan]";

/// Command-line arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Args {
    pub job_file: PathBuf,
    pub options: RunOptions,
    /// Print the phase plan as JSON instead of running.
    pub plan: bool,
}

impl Args {
    /// Parse arguments, excluding the program name.
    pub fn parse<I>(args: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = String>,
    {
        let mut job_file = None;
        let mut options = RunOptions::default();
        let mut plan = false;

        for arg in args {
            match arg.as_str() {
                "--force" => options.force_recompute = true,
                "--rerun-failed" => options.rerun_failed = true,
                "--plan" => plan = true,
                flag if flag.starts_with("--") => return Err(format!("unknown flag '{flag}'")),
                path if job_file.is_none() => job_file = Some(PathBuf::from(path)),
                extra => return Err(format!("unexpected argument '{extra}'")),
            }
        }

        let job_file = job_file.ok_or_else(|| "missing job file".to_string())?;
        Ok(Self {
            job_file,
            options,
            plan,
        })
    }
}
