use comfy_table::{Cell, Table};
use flotilla_core::error::Result;
use flotilla_core::{ClusterNodes, Node};
use serde_json::{json, Value};

/// One row per node, control plane first.
pub fn render_table(nodes: &ClusterNodes) -> Table {
    let mut table = Table::new();
    table.set_header(vec![
        "Role",
        "Instance",
        "State",
        "Public DNS",
        "Private DNS",
        "Zone",
        "Lifecycle",
        "Launched",
    ]);

    for (role, members) in nodes.roles() {
        for node in members {
            let launched = node
                .launch_time
                .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "-".to_string());
            table.add_row(vec![
                Cell::new(role),
                Cell::new(&node.id),
                Cell::new(node.state),
                Cell::new(&node.public_dns),
                Cell::new(&node.private_dns),
                Cell::new(&node.zone),
                Cell::new(lifecycle(node)),
                Cell::new(launched),
            ]);
        }
    }
    table
}

fn lifecycle(node: &Node) -> &'static str {
    if node.is_spot() {
        "spot"
    } else {
        "on-demand"
    }
}

/// Operator-facing address listing: public names of every node, then the
/// private names the nodes use to reach each other.
pub fn address_lines(nodes: &ClusterNodes) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(aux) = nodes.auxiliary() {
        lines.push(format!("Ambari: {}", aux.public_dns));
    }
    if let Some(master) = nodes.control_plane() {
        lines.push(format!("Master: {}", master.public_dns));
    }
    for slave in nodes.workers() {
        lines.push(format!("Slave: {}", slave.public_dns));
    }
    if let Some(master) = nodes.control_plane() {
        lines.push(format!("Master: {}", master.private_dns));
    }
    lines.push("Slaves:".to_string());
    for slave in nodes.workers() {
        lines.push(format!("\t{}", slave.private_dns));
    }
    lines
}

fn node_json(node: &Node) -> Value {
    json!({
        "id": node.id,
        "public_dns": node.public_dns,
        "private_dns": node.private_dns,
        "state": node.state,
        "zone": node.zone,
        "spot": node.is_spot(),
    })
}

/// Role to address mapping. Single-node roles map to an object (or null),
/// workers to an array.
pub fn to_json(nodes: &ClusterNodes) -> Value {
    json!({
        "master": nodes.control_plane().map(node_json),
        "ambari": nodes.auxiliary().map(node_json),
        "slaves": nodes.workers().iter().map(node_json).collect::<Vec<_>>(),
    })
}

pub fn print_info(nodes: &ClusterNodes, as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", colored_json::to_colored_json_auto(&to_json(nodes))?);
        return Ok(());
    }
    if nodes.is_empty() {
        println!("No nodes found.");
        return Ok(());
    }
    println!("{}", render_table(nodes));
    for line in address_lines(nodes) {
        println!("{}", line);
    }
    Ok(())
}
