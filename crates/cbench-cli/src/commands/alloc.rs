use std::path::Path;

use super::load_cluster;

pub fn alloc(cluster_file: &Path, slots: usize, allow_repeat: bool, format: &str) -> anyhow::Result<i32> {
    let cluster = load_cluster(cluster_file)?;
    let deployment = cluster.pool().allocate(slots, allow_repeat)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(deployment.nodes())?);
        }
        _ => {
            for (position, node) in deployment.nodes().iter().enumerate() {
                println!("{:>4}  {}", position + 1, node.label());
            }
        }
    }

    Ok(0)
}
