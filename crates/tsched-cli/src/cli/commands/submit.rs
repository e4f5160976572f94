//! `tsched submit` – insert a transfer job into the queue.

use anyhow::{anyhow, Result};
use tsched_core::storage::{FileSubmission, JobSubmission, SqlStorage};
use tsched_core::transfer::Checksum;

use crate::cli::SubmitArgs;

pub async fn run_submit(storage: &SqlStorage, args: &SubmitArgs) -> Result<String> {
    if let Some(proxy) = &args.proxy {
        storage
            .add_credential(&args.cred_id, &args.user_dn, proxy)
            .await?;
    }

    let checksum = args.checksum.as_deref().map(Checksum::parse);
    let mut files = vec![FileSubmission {
        source_surl: args.source.clone(),
        dest_surl: args.destination.clone(),
        checksum: checksum.clone(),
        filesize: args.filesize,
        metadata: None,
        activity: args.activity.clone(),
    }];

    for pair in &args.extra_files {
        let (source, dest) = pair
            .split_once(',')
            .ok_or_else(|| anyhow!("--file expects SOURCE,DESTINATION, got {pair:?}"))?;
        files.push(FileSubmission {
            source_surl: source.to_string(),
            dest_surl: dest.to_string(),
            checksum: checksum.clone(),
            filesize: args.filesize,
            metadata: None,
            activity: args.activity.clone(),
        });
    }

    let submission = JobSubmission {
        vo_name: args.vo.clone(),
        user_dn: args.user_dn.clone(),
        cred_id: args.cred_id.clone(),
        mode: args.mode.into(),
        files,
    };
    let job_id = storage.submit_job(&submission).await?;
    tracing::info!(job_id = %job_id, files = submission.files.len(), "job submitted");
    Ok(job_id)
}
