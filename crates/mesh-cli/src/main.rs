use clap::{Parser, Subcommand};
use serde_json::{json, Value};

#[derive(Parser, Debug)]
#[command(name = "mesh", about = "MIDI mesh management CLI")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Node control API URL
    #[arg(short, long, default_value = "http://localhost:8070", global = true)]
    url: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show node status
    Status,
    /// List all known devices, local and remote
    Devices,
    /// List peer connections
    Peers,
    /// Dump the routing table
    Table,
    /// Forwarding rules
    Rules {
        #[command(subcommand)]
        action: RuleAction,
    },
}

#[derive(Subcommand, Debug)]
enum RuleAction {
    /// List rules with statistics
    List,
    /// Add a rule: node ids are UUIDs or "local"
    Add {
        source_node: String,
        source_device: u16,
        dest_node: String,
        dest_device: u16,
        /// Higher wins on the same source
        #[arg(long, default_value_t = 100)]
        priority: i32,
        /// Only forward this MIDI channel (0-15)
        #[arg(long)]
        channel: Option<u8>,
        /// Hop budget for relayed events (1-31)
        #[arg(long, default_value_t = 4)]
        ttl: u8,
    },
    /// Delete a rule
    Rm { rule_id: String },
    /// Enable a rule
    Enable { rule_id: String },
    /// Disable a rule
    Disable { rule_id: String },
}

async fn set_enabled(
    client: &reqwest::Client,
    base: &str,
    rule_id: &str,
    enabled: bool,
) -> anyhow::Result<()> {
    let resp = client
        .put(format!("{}/routing/rules/{}", base, rule_id))
        .json(&json!({ "enabled": enabled }))
        .send()
        .await?;
    if resp.status().is_success() {
        println!("Rule {} {}", rule_id, if enabled { "enabled" } else { "disabled" });
    } else {
        let err: Value = resp.json().await.unwrap_or_default();
        anyhow::bail!("update failed: {}", err["error"].as_str().unwrap_or("unknown"));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let client = reqwest::Client::new();
    let base = args.url.trim_end_matches('/');

    match args.command {
        Commands::Status => {
            let resp: Value = client
                .get(format!("{}/status", base))
                .send().await?
                .json().await?;
            println!("Mesh Node Status");
            println!("══════════════════════════════");
            println!("  Node:      {} ({})", resp["name"].as_str().unwrap_or("?"), resp["nodeId"].as_str().unwrap_or("?"));
            println!("  Uptime:    {}s", resp["uptimeSeconds"]);
            println!("  Devices:   {}", resp["devices"]);
            println!("  Rules:     {} active, {} pending", resp["rules"]["active"], resp["rules"]["pending"]);
            println!("  Peers:     {} total, {} connected, {} failed",
                resp["peers"]["total"], resp["peers"]["connected"], resp["peers"]["failed"]);
            println!("  Forwarded: {} local, {} remote, {} dropped",
                resp["engine"]["deliveredLocal"], resp["engine"]["deliveredRemote"], resp["engine"]["dropped"]);
        }
        Commands::Devices => {
            let resp: Value = client
                .get(format!("{}/devices", base))
                .send().await?
                .json().await?;
            println!("Devices");
            println!("══════════════════════════════");
            if let Some(devices) = resp["devices"].as_array() {
                if devices.is_empty() {
                    println!("  No devices known");
                }
                for d in devices {
                    let local = if d["isLocal"].as_bool().unwrap_or(false) { "local" } else { "remote" };
                    println!("  [{} #{}] {} ({}, {})",
                        d["nodeId"].as_str().unwrap_or("?"), d["deviceId"],
                        d["name"].as_str().unwrap_or("?"), d["direction"].as_str().unwrap_or("?"), local);
                }
            }
        }
        Commands::Peers => {
            let resp: Value = client
                .get(format!("{}/peers", base))
                .send().await?
                .json().await?;
            println!("Peers");
            println!("══════════════════════════════");
            if let Some(peers) = resp["peers"].as_array() {
                if peers.is_empty() {
                    println!("  No peers configured");
                }
                for p in peers {
                    println!("  {} [{}] {} — heartbeat {}ms ago, {} devices",
                        p["name"].as_str().unwrap_or("?"),
                        p["state"].as_str().unwrap_or("?"),
                        p["nodeId"].as_str().unwrap_or("?"),
                        p["timeSinceLastHeartbeatMs"],
                        p["devicesKnown"]);
                }
            }
        }
        Commands::Table => {
            let resp: Value = client
                .get(format!("{}/routing/table", base))
                .send().await?
                .json().await?;
            println!("Routing Table");
            println!("══════════════════════════════");
            if let Some(entries) = resp["entries"].as_array() {
                for e in entries {
                    println!("  ({}, {}) -> {} [{}{}]",
                        e["nodeId"].as_str().unwrap_or("?"), e["deviceId"],
                        e["name"].as_str().unwrap_or("?"),
                        e["direction"].as_str().unwrap_or("?"),
                        if e["isLocal"].as_bool().unwrap_or(false) { ", local" } else { "" });
                }
            }
        }
        Commands::Rules { action } => match action {
            RuleAction::List => {
                let resp: Value = client
                    .get(format!("{}/routing/rules", base))
                    .send().await?
                    .json().await?;
                println!("Forwarding Rules");
                println!("══════════════════════════════");
                if let Some(rules) = resp["rules"].as_array() {
                    if rules.is_empty() {
                        println!("  No rules configured");
                    }
                    for r in rules {
                        let flags = match (r["enabled"].as_bool(), r["pending"].as_bool()) {
                            (Some(false), _) => " [disabled]",
                            (_, Some(true)) => " [pending]",
                            _ => "",
                        };
                        println!("  {} prio {}{}", r["ruleId"].as_str().unwrap_or("?"), r["priority"], flags);
                        println!("    ({}, {}) -> ({}, {})",
                            r["source"]["nodeId"].as_str().unwrap_or("?"), r["source"]["deviceId"],
                            r["destination"]["nodeId"].as_str().unwrap_or("?"), r["destination"]["deviceId"]);
                        println!("    forwarded {} dropped {}", r["forwarded"], r["dropped"]);
                    }
                }
            }
            RuleAction::Add {
                source_node,
                source_device,
                dest_node,
                dest_device,
                priority,
                channel,
                ttl,
            } => {
                let mut body = json!({
                    "source": { "nodeId": source_node, "deviceId": source_device },
                    "destination": { "nodeId": dest_node, "deviceId": dest_device },
                    "priority": priority,
                    "ttl": ttl,
                });
                if let Some(ch) = channel {
                    body["channelFilter"] = json!(ch);
                }
                let resp = client
                    .post(format!("{}/routing/rules", base))
                    .json(&body)
                    .send().await?;
                if resp.status().is_success() {
                    let out: Value = resp.json().await?;
                    println!("Created rule {}", out["ruleId"].as_str().unwrap_or("?"));
                } else {
                    let status = resp.status();
                    let err: Value = resp.json().await.unwrap_or_default();
                    anyhow::bail!(
                        "rule rejected ({}): {}",
                        status,
                        err["error"].as_str().unwrap_or("unknown")
                    );
                }
            }
            RuleAction::Rm { rule_id } => {
                let resp = client
                    .delete(format!("{}/routing/rules/{}", base, rule_id))
                    .send().await?;
                if resp.status().is_success() {
                    println!("Deleted rule {}", rule_id);
                } else {
                    anyhow::bail!("delete failed: {}", resp.status());
                }
            }
            RuleAction::Enable { rule_id } => set_enabled(&client, base, &rule_id, true).await?,
            RuleAction::Disable { rule_id } => set_enabled(&client, base, &rule_id, false).await?,
        },
    }

    Ok(())
}
