use std::time::Duration;

mod config;
mod db;
mod error;
mod models;
mod monitor;
mod notice;
mod notify;
mod portal;

use config::Config;
use error::Result;
use models::Recipient;
use monitor::Monitor;
use notify::Transport;
use portal::split_room;

/// Stand-in transport printing rendered messages to stdout. A real chat
/// platform plugs in behind the same trait.
struct ConsoleTransport;

impl Transport for ConsoleTransport {
    async fn send(&self, recipient: &Recipient, message: &str) -> anyhow::Result<()> {
        println!("→ {}\n{}\n", recipient, message);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let config = Config::load()?;
    let monitor = Monitor::new(config.clone(), ConsoleTransport).await?;

    match args.get(1).map(String::as_str) {
        Some("--check-once") => {
            let new_count = monitor.check_all_sites().await?;
            println!("found {} new notices", new_count);
        }
        Some("--changes") => {
            let detected = monitor.detect_changes_all().await?;
            println!("detected {} timetable changes", detected);
        }
        Some("--timetable") => {
            let subject = args
                .get(2)
                .ok_or_else(|| anyhow::anyhow!("usage: --timetable <subject_id> [week]"))?;
            let week = match args.get(3) {
                Some(w) => w
                    .parse()
                    .map_err(|_| anyhow::anyhow!("week must be a positive integer"))?,
                None => monitor.current_week(),
            };
            print_week(&monitor, subject, week).await?;
        }
        Some("--recent") => {
            let limit = args
                .get(2)
                .and_then(|n| n.parse().ok())
                .unwrap_or(5)
                .clamp(1, 20);
            print_recent(&monitor, limit).await?;
        }
        Some("--since") => {
            let cutoff = args
                .get(2)
                .ok_or_else(|| anyhow::anyhow!("usage: --since <YYYY-MM-DD>"))?;
            let notices = monitor.notices_since(cutoff.clone()).await?;
            if notices.is_empty() {
                println!("no notices published since {}", cutoff);
            }
            for (i, n) in notices.iter().enumerate() {
                println!("{}. {} [{}]\n   {}", i + 1, n.title, n.publish_date, n.url);
            }
        }
        Some("--stats") => {
            let (total, per_site) = monitor.notice_counts().await?;
            println!("{} notices stored", total);
            for (site, count) in per_site {
                println!("  {}: {}", site, count);
            }
        }
        Some("--purge") => {
            let purged = monitor.purge_notices().await?;
            println!("purged {} notices", purged);
        }
        Some("--obfuscate") => {
            // Helper for filling the [subjects] secret field in config.toml.
            let secret = args
                .get(2)
                .ok_or_else(|| anyhow::anyhow!("usage: --obfuscate <secret>"))?;
            println!("{}", portal::obfuscate_secret(secret));
        }
        Some(other) => {
            eprintln!("unknown argument: {}", other);
            eprintln!(
                "usage: campus-watch [--check-once | --changes | --timetable <subject> [week] | --recent [n] | --since <date> | --stats | --purge | --obfuscate <secret>]"
            );
            std::process::exit(2);
        }
        None => run_daemon(&config, &monitor).await,
    }

    Ok(())
}

/// The scheduler: fixed intervals drive the idempotent entry points. Any
/// failed run is logged and retried on the next tick; no error is fatal.
async fn run_daemon(config: &Config, monitor: &Monitor<ConsoleTransport>) {
    tracing::info!(
        "watching {} sites every {}s, timetables every {}s",
        config.sites.iter().filter(|s| s.enabled).count(),
        config.check_interval_secs,
        config.timetable_check_interval_secs
    );

    let mut site_ticker =
        tokio::time::interval(Duration::from_secs(config.check_interval_secs.max(30)));
    let mut timetable_ticker = tokio::time::interval(Duration::from_secs(
        config.timetable_check_interval_secs.max(60),
    ));

    loop {
        tokio::select! {
            _ = site_ticker.tick() => {
                if let Err(e) = monitor.check_all_sites().await {
                    tracing::error!("notice check cycle failed: {}", e);
                }
            }
            _ = timetable_ticker.tick() => {
                if config.subjects.is_empty() {
                    continue;
                }
                if let Err(e) = monitor.detect_changes_all().await {
                    tracing::error!("timetable check cycle failed: {}", e);
                }
            }
        }
    }
}

async fn print_week(
    monitor: &Monitor<ConsoleTransport>,
    subject: &str,
    week: u32,
) -> Result<()> {
    let records = monitor.week_view(subject, week).await?;
    if records.is_empty() {
        println!("no courses stored for {} in week {}", subject, week);
        return Ok(());
    }
    println!("week {} timetable for {}:", week, subject);
    for r in records {
        let (building, room_no) = split_room(&r.room);
        let place = if room_no.is_empty() {
            building
        } else {
            format!("{} {}", building, room_no)
        };
        println!(
            "  day {} section {} {}-{}  {}  {}  {}",
            r.day_of_week, r.section_code, r.start_time, r.end_time, r.short_name, r.teacher, place
        );
    }
    Ok(())
}

async fn print_recent(monitor: &Monitor<ConsoleTransport>, limit: u32) -> Result<()> {
    let notices = monitor.recent_notices(limit).await?;
    if notices.is_empty() {
        println!("no notices stored yet");
        return Ok(());
    }
    for (i, n) in notices.iter().enumerate() {
        let title: String = if n.title.chars().count() > 30 {
            let short: String = n.title.chars().take(30).collect();
            format!("{}...", short)
        } else {
            n.title.clone()
        };
        println!("{}. {} [{}]\n   {}", i + 1, title, n.publish_date, n.url);
    }
    Ok(())
}
