#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]

#[macro_use]
extern crate tracing;

use std::sync::Arc;

use anyhow::Context as _;
use asset_graph::{Asset, DynGraphStore, RelationLabel};
use asset_graph_memory::{GraphSnapshot, MemoryGraph};
use camino::Utf8PathBuf;
use colored::Colorize as _;
use perimeter::assoc::{associations, contact_details};
use perimeter::normalize::clean_fqdn;
use seahorse::{App, Context, Flag, FlagType};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

fn main() {
    let app = App::new(env!("CARGO_PKG_NAME"))
        .description(env!("CARGO_PKG_DESCRIPTION"))
        .version(env!("CARGO_PKG_VERSION"))
        .usage(usage())
        .flag(Flag::new("domain", FlagType::String).description("Seed domain (comma-separated for several)").alias("d"))
        .flag(Flag::new("domains-file", FlagType::String).description("File with one seed domain per line").alias("df"))
        .flag(Flag::new("config", FlagType::String).description("Path to the engine configuration file").alias("config"))
        .flag(Flag::new("dir", FlagType::String).description("Directory holding the collected graph").alias("dir"))
        .flag(Flag::new("since", FlagType::String).description("Cutoff, 'MM/DD HH:MM:SS YYYY UTC'").alias("since"))
        .flag(Flag::new("verbose", FlagType::Bool).description("Expand registrant contact details").alias("v"))
        .flag(Flag::new("silent", FlagType::Bool).description("Suppress log output").alias("silent"))
        .flag(Flag::new("nocolor", FlagType::Bool).description("Disable colored output").alias("nocolor"))
        .action(assoc_action);

    app.run(std::env::args().collect());
}

fn usage() -> String {
    format!(
        "{command} -d <DOMAIN> [-df <FILE>] [-config <PATH>] [-dir <PATH>] [-since <CUTOFF>] [-v] [-silent] [-nocolor]\n\
        \n\
        \tExample:\n\
        \n\
        \t  {command} -d example.com -v",
        command = env!("CARGO_PKG_NAME"),
    )
}

fn assoc_action(c: &Context) {
    exit(run(c));
}

fn exit(res: anyhow::Result<()>) -> ! {
    match res {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("{e:?}");
            std::process::exit(1);
        }
    }
}

fn run(c: &Context) -> anyhow::Result<()> {
    if c.bool_flag("nocolor") {
        colored::control::set_override(false);
    }

    if !c.bool_flag("silent") {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .init();
    }

    if let Ok(config_path) = c.string_flag("config") {
        let parent = Utf8PathBuf::from(&config_path)
            .parent()
            .map(ToOwned::to_owned)
            .context("config path has no parent directory")?;
        // SAFETY: At this point the program is single-threaded.
        unsafe { std::env::set_var("PERIMETER_CONFIG_PATH", parent) };
    }

    let domains = collect_domains(c)?;
    anyhow::ensure!(!domains.is_empty(), "no seed domain given; use -d or -df");

    let since = c
        .string_flag("since")
        .ok()
        .map(|raw| parse_since(&raw))
        .transpose()
        .context("invalid -since value")?;

    let dir = c
        .string_flag("dir")
        .map(Utf8PathBuf::from)
        .unwrap_or_else(|_| perimeter::config::get_data_dir());
    let graph_path = dir.join("graph.json");

    let json = std::fs::read(&graph_path).with_context(|| format!("couldn't open the graph at {graph_path}"))?;
    let snapshot: GraphSnapshot =
        serde_json::from_slice(&json).with_context(|| format!("invalid graph snapshot at {graph_path}"))?;

    debug!(assets = snapshot.assets.len(), "Graph snapshot loaded");

    let graph: DynGraphStore = Arc::new(MemoryGraph::from_snapshot(snapshot));

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .context("runtime build failed")?;

    rt.block_on(async {
        for domain in &domains {
            print_associations(&graph, domain, since, c.bool_flag("verbose")).await?;
        }
        anyhow::Ok(())
    })?;

    Ok(())
}

fn collect_domains(c: &Context) -> anyhow::Result<Vec<String>> {
    let mut raw_names: Vec<String> = Vec::new();

    if let Ok(flag) = c.string_flag("domain") {
        raw_names.extend(flag.split(',').map(str::to_owned));
    }

    if let Ok(path) = c.string_flag("domains-file") {
        let contents = std::fs::read_to_string(&path).with_context(|| format!("couldn't read {path}"))?;

        for line in contents.lines() {
            // Skip blank lines and commented lines.
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            raw_names.push(line.to_owned());
        }
    }

    raw_names.extend(c.args.iter().cloned());

    let mut domains = Vec::new();
    for raw in raw_names {
        let name = clean_fqdn(&raw).with_context(|| format!("invalid domain name: {raw}"))?;
        let name = name.to_string();
        if !domains.contains(&name) {
            domains.push(name);
        }
    }

    Ok(domains)
}

/// Accepts the literal layout `MM/DD HH:MM:SS YYYY TZ`; all stored instants
/// are UTC, so that is the only timezone honored.
fn parse_since(raw: &str) -> anyhow::Result<OffsetDateTime> {
    let trimmed = raw.trim();

    let naive = trimmed
        .strip_suffix(" UTC")
        .or_else(|| trimmed.strip_suffix(" Z"))
        .context("timestamp must end with ' UTC'")?;

    let format = format_description!("[month]/[day] [hour]:[minute]:[second] [year]");
    let parsed = PrimitiveDateTime::parse(naive, &format).context("expected 'MM/DD HH:MM:SS YYYY UTC'")?;

    Ok(parsed.assume_utc())
}

async fn print_associations(
    graph: &DynGraphStore,
    domain: &str,
    since: Option<OffsetDateTime>,
    verbose: bool,
) -> anyhow::Result<()> {
    let closure = associations(graph, domain, since)
        .await
        .with_context(|| format!("association lookup failed for {domain}"))?;

    println!("{}", domain.bold());

    if closure.is_empty() {
        println!("\t{}", "no associations recorded".dimmed());
        return Ok(());
    }

    for stored in closure {
        println!("\t{}", primary_key_line(&stored.asset).cyan());

        if !verbose {
            continue;
        }

        let details = contact_details(graph, stored.id, since).await?;
        for (label, detail) in details {
            println!("\t\t{}: {}", label.as_str().dimmed(), detail.asset.key());
        }
    }

    Ok(())
}

/// The line identifying one association: domain, ASN handle or CIDR.
fn primary_key_line(asset: &Asset) -> String {
    match asset {
        Asset::DomainRecord { domain, .. } => domain.to_string(),
        Asset::AutnumRecord { handle, .. } => handle.to_string(),
        Asset::IpNetRecord { cidr, .. } => cidr.to_string(),
        other => other.key(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn since_layout_parses_as_utc() {
        let parsed = parse_since("01/02 15:04:05 2006 UTC").unwrap();

        assert_eq!(parsed.year(), 2006);
        assert_eq!(u8::from(parsed.month()), 1);
        assert_eq!(parsed.day(), 2);
        assert_eq!(parsed.hour(), 15);
        assert_eq!(parsed.offset(), time::UtcOffset::UTC);
    }

    #[rstest]
    #[case("01/02 15:04:05 2006 MST")]
    #[case("2006-01-02T15:04:05Z")]
    #[case("01/02 15:04:05")]
    fn other_layouts_are_rejected(#[case] raw: &str) {
        assert!(parse_since(raw).is_err());
    }

    #[test]
    fn primary_key_lines_per_record_kind() {
        let record = Asset::DomainRecord {
            domain: "example.net".into(),
            name: None,
            registrar: None,
            expiration: None,
            statuses: Vec::new(),
        };
        assert_eq!(primary_key_line(&record), "example.net");

        let autnum = Asset::AutnumRecord {
            handle: "AS64500".into(),
            name: None,
            status: None,
            updated: None,
        };
        assert_eq!(primary_key_line(&autnum), "AS64500");

        let ipnet = Asset::IpNetRecord {
            cidr: "192.0.2.0/24".parse().unwrap(),
            name: None,
            status: None,
            updated: None,
        };
        assert_eq!(primary_key_line(&ipnet), "192.0.2.0/24");
    }
}
