//! `tsched status` – show jobs and per-file transfer states.

use anyhow::Result;
use tsched_core::storage::SqlStorage;

pub async fn run_status(storage: &SqlStorage, job: Option<&str>) -> Result<()> {
    match job {
        Some(job_id) => {
            let files = storage.list_files(job_id).await?;
            if files.is_empty() {
                println!("no files for job {job_id}");
                return Ok(());
            }
            println!("{:<8} {:<10} {:<40} {}", "FILE", "STATE", "SOURCE", "DESTINATION");
            for file in &files {
                println!(
                    "{:<8} {:<10} {:<40} {}",
                    file.file_id,
                    file.file_state.as_str(),
                    file.source_surl,
                    file.dest_surl
                );
                if let Some(reason) = &file.reason {
                    println!("         reason: {reason}");
                }
            }
        }
        None => {
            let jobs = storage.list_jobs().await?;
            if jobs.is_empty() {
                println!("no jobs");
                return Ok(());
            }
            println!(
                "{:<36} {:<10} {:<10} {:<9} {:>5} {:>7} {:>9}",
                "JOB", "STATE", "VO", "MODE", "FILES", "FAILED", "FINISHED"
            );
            for job in &jobs {
                println!(
                    "{:<36} {:<10} {:<10} {:<9} {:>5} {:>7} {:>9}",
                    job.job_id,
                    job.job_state,
                    job.vo_name,
                    job.mode.as_str(),
                    job.file_total,
                    job.file_failed,
                    job.file_finished
                );
            }
        }
    }
    Ok(())
}
