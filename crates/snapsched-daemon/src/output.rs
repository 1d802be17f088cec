use chrono::{DateTime, Utc};
use serde::Serialize;
use snapsched_scheduler::{Health, ScheduleListing, ScheduleStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Plain,
    Json,
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn print_listing(listing: &ScheduleListing, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => print_json(listing),
        OutputFormat::Plain => {
            print!("{}", render_listing(listing));
            Ok(())
        }
    }
}

pub fn print_statuses(statuses: &[ScheduleStatus], format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => print_json(statuses),
        OutputFormat::Plain => {
            if statuses.is_empty() {
                println!("no schedules");
            }
            for status in statuses {
                print!("{}", render_status(status));
            }
            Ok(())
        }
    }
}

/// Short confirmation for mutating commands.
pub fn print_message(message: &str, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => print_json(&serde_json::json!({ "ok": true, "message": message })),
        OutputFormat::Plain => {
            println!("{message}");
            Ok(())
        }
    }
}

fn scope(fs: &str, path: &str, subvol: &Option<String>, group: &Option<String>) -> String {
    match (subvol, group) {
        (Some(sv), Some(g)) => format!("{fs}:{path} (subvol={sv}, group={g})"),
        (Some(sv), None) => format!("{fs}:{path} (subvol={sv})"),
        _ => format!("{fs}:{path}"),
    }
}

fn ts(t: &Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| "-".to_string())
}

fn retention_line(retention: &std::collections::BTreeMap<String, u32>) -> String {
    if retention.is_empty() {
        return "none".to_string();
    }
    retention
        .iter()
        .map(|(period, count)| format!("{count}{period}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn render_listing(listing: &ScheduleListing) -> String {
    let mut out = format!(
        "{}\n",
        scope(&listing.fs_name, &listing.path, &listing.subvol, &listing.group)
    );
    for entry in &listing.schedules {
        out.push_str(&format!(
            "  {:<6} start {}  {}\n",
            entry.cadence.to_string(),
            ts(&Some(entry.start)),
            if entry.active { "active" } else { "inactive" }
        ));
    }
    out.push_str(&format!("  retention: {}\n", retention_line(&listing.retention)));
    out
}

fn render_health(health: &Health) -> String {
    match health {
        Health::Healthy => "healthy".to_string(),
        Health::Degraded {
            consecutive_failures,
            since,
        } => format!(
            "degraded ({consecutive_failures} failures since {})",
            ts(&Some(*since))
        ),
        Health::Deactivated => "deactivated".to_string(),
    }
}

fn render_status(s: &ScheduleStatus) -> String {
    format!(
        "{} every {}\n  health:     {}\n  created:    {}  last {}\n  pruned:     {}  last {}\n  missed:     {}\n  next fire:  {}\n  retention:  {}\n",
        scope(&s.fs_name, &s.path, &s.subvol, &s.group),
        s.cadence,
        render_health(&s.health),
        s.created_count,
        ts(&s.last_fired_at),
        s.pruned_count,
        ts(&s.last_pruned_at),
        ts(&s.last_missed_at),
        ts(&s.next_fire_at),
        retention_line(&s.retention),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use snapsched_scheduler::Cadence;
    use std::collections::BTreeMap;

    fn listing() -> ScheduleListing {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        ScheduleListing {
            fs_name: "cephfs".into(),
            path: "/volumes/_nogroup/sv1".into(),
            subvol: Some("sv1".into()),
            group: None,
            schedules: vec![snapsched_scheduler::types::ListedCadence {
                cadence: "1h".parse::<Cadence>().unwrap(),
                start,
                active: true,
            }],
            retention: BTreeMap::from([("h".to_string(), 24), ("n".to_string(), 5)]),
            active: true,
        }
    }

    #[test]
    fn plain_listing_shows_cadences_and_retention() {
        let text = render_listing(&listing());
        assert!(text.starts_with("cephfs:/volumes/_nogroup/sv1 (subvol=sv1)\n"));
        assert!(text.contains("1h"));
        assert!(text.contains("2026-03-01T00:00:00Z"));
        assert!(text.contains("active"));
        assert!(text.contains("retention: 24h 5n"));
    }

    #[test]
    fn empty_retention_reads_none() {
        assert_eq!(retention_line(&BTreeMap::new()), "none");
    }

    #[test]
    fn degraded_health_names_failure_count() {
        let since = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let text = render_health(&Health::Degraded {
            consecutive_failures: 2,
            since,
        });
        assert_eq!(text, "degraded (2 failures since 2026-03-01T12:00:00Z)");
    }
}
