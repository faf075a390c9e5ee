use std::time::Duration;

use cbench_proc::ProcSet;
use cbench_sim::LocalCluster;

pub async fn local(cluster: LocalCluster, duration: Option<Duration>) -> anyhow::Result<i32> {
    let mut set = ProcSet::new();
    let dir = std::env::current_dir()?;

    cluster.start(&mut set, &dir).await?;
    println!("{}", cluster.oh_template());
    cluster.supervise(&mut set, duration).await?;

    Ok(if set.any_killed() { 1 } else { 0 })
}
