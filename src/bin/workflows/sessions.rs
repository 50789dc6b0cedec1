use anyhow::Result;
use distro_forge::checkpoint::{self, ResumePoint};
use distro_forge::session::{SessionStore, SessionSummary};
use distro_forge::{BuildConfig, Phase};
use time::format_description::well_known::Rfc3339;

pub(crate) fn list_sessions(config: &BuildConfig) -> Result<()> {
    let store = SessionStore::new(&config.build.state_dir);
    let sessions = store.list()?;
    if sessions.is_empty() {
        println!("[forge] no sessions under '{}'", store.state_dir().display());
        return Ok(());
    }
    for summary in &sessions {
        let session = &summary.session;
        let started = session
            .started_at
            .format(&Rfc3339)
            .unwrap_or_else(|_| "-".to_string());
        println!(
            "[forge:{}] {:<9} variant={} phase={}/{} {} started={}",
            session.id,
            format!("{:?}", session.status).to_lowercase(),
            session.variant,
            session.current_phase,
            Phase::COUNT,
            resume_label(summary),
            started
        );
        if let Some(reason) = &session.pause_reason {
            println!("[forge:{}]   paused: {reason}", session.id);
        }
        if let Some(error) = &session.error {
            println!("[forge:{}]   error: {error}", session.id);
        }
    }
    Ok(())
}

fn resume_label(summary: &SessionSummary) -> String {
    if summary.archived {
        return "archived".to_string();
    }
    match checkpoint::load(&summary.checkpoint_log) {
        Ok(entries) => match checkpoint::resume_point(&entries, Phase::COUNT) {
            ResumePoint::Phase(index) => match Phase::from_index(index) {
                Some(phase) => format!("resume-at={index}:{phase}"),
                None => format!("resume-at={index}"),
            },
            ResumePoint::Finished => "resume-at=finalize".to_string(),
        },
        Err(e) => format!("checkpoints unreadable ({e})"),
    }
}

pub(crate) fn prune_sessions(config: &BuildConfig, keep: usize) -> Result<()> {
    let store = SessionStore::new(&config.build.state_dir);
    let removed = store.prune(keep)?;
    for id in &removed {
        println!("[forge:{id}] pruned");
    }
    println!("[forge] pruned {} archived sessions, kept {keep}", removed.len());
    Ok(())
}
