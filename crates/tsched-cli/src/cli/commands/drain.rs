//! `tsched drain` – stop or resume dispatch on this host.

use anyhow::Result;
use tsched_core::storage::SqlStorage;

pub async fn run_drain(storage: &SqlStorage, active: bool) -> Result<()> {
    storage.set_drain(active).await?;
    if active {
        println!("drain mode on: no new transfers will be dispatched");
    } else {
        println!("drain mode off: dispatch resumes on the next round");
    }
    Ok(())
}
