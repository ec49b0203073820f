//! Offline commands that work on the data directory without a running server.

use anyhow::{Context, Result};
use wa_session::{AuthStore, Direction, EventLog, EventRecord};

use crate::config::RelayPaths;
use crate::export::to_csv;

fn table(records: &[EventRecord]) -> String {
    let mut out = format!(
        "{:<25} {:<4} {:<16} {:<10} {}\n",
        "TIME", "DIR", "NUMBER", "SOURCE", "TEXT"
    );
    out.push_str(&"-".repeat(80));
    out.push('\n');
    for r in records {
        let direction = match r.direction {
            Direction::In => "in",
            Direction::Out if r.ok == Some(false) => "out!",
            Direction::Out => "out",
        };
        let mut text = r.text.clone().unwrap_or_default().replace('\n', " ");
        if let Some(error) = &r.error {
            text = format!("{} [{}]", text, error);
        }
        out.push_str(&format!(
            "{:<25} {:<4} {:<16} {:<10} {}\n",
            r.iso,
            direction,
            r.number.as_deref().unwrap_or("-"),
            r.source.map(|s| s.as_str()).unwrap_or("-"),
            text
        ));
    }
    out.push_str(&format!("\n{} event(s)", records.len()));
    out
}

/// Print the newest records of the event log.
pub async fn events_command(paths: &RelayPaths, limit: usize, since: i64, csv: bool) -> Result<()> {
    let log = EventLog::open(&paths.events_path)
        .await
        .with_context(|| format!("Failed to open event log {:?}", paths.events_path))?;
    let records = log.tail(limit.max(1), since).await;
    if csv {
        println!("{}", to_csv(&records));
    } else if records.is_empty() {
        println!("No events.");
    } else {
        println!("{}", table(&records));
    }
    Ok(())
}

/// Remove a session's credentials. The server must not be running that session.
pub async fn wipe_auth_command(paths: &RelayPaths, agent: &str) -> Result<()> {
    wa_session::auth_store::validate_agent_id(agent)?;
    let store = AuthStore::new(&paths.auth_dir);
    let outcome = store
        .wipe(agent)
        .await
        .with_context(|| format!("Failed to wipe credentials for '{}'", agent))?;
    eprintln!(
        "Wiped {} ({})",
        outcome.path.display(),
        outcome.strategy.as_str()
    );
    Ok(())
}
