use std::sync::Mutex;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use permaudit::AuditProgress;

/// Consolidated progress state to avoid multiple mutex locks.
#[derive(Default)]
struct ProgressState {
    /// Spinner for repository discovery.
    discover_bar: Option<ProgressBar>,
    /// Bar for repositories whose collaborators are folded in.
    audit_bar: Option<ProgressBar>,
    /// Discovery finished; the audit bar length is final.
    discovery_done: bool,
}

/// Interactive progress reporter using indicatif.
pub struct InteractiveReporter {
    multi: MultiProgress,
    state: Mutex<ProgressState>,
}

impl InteractiveReporter {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            state: Mutex::new(ProgressState::default()),
        }
    }

    fn audit_bar(&self, state: &mut ProgressState) -> ProgressBar {
        if let Some(ref pb) = state.audit_bar {
            return pb.clone();
        }
        let pb = self.multi.add(ProgressBar::new(0));
        pb.set_style(Self::bar_style());
        pb.set_prefix(format!("{:12}", "Auditing"));
        state.audit_bar = Some(pb.clone());
        pb
    }

    pub fn handle(&self, event: AuditProgress) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        match event {
            AuditProgress::Authenticated { login, .. } => {
                drop(state);
                self.multi.println(format!("✓ authenticated as {}", login)).ok();
            }

            AuditProgress::OrganizationAccess {
                org,
                is_member,
                can_administer,
            } => {
                drop(state);
                let role = match (is_member, can_administer) {
                    (_, true) => "admin",
                    (true, false) => "member",
                    (false, false) => "not a member",
                };
                self.multi.println(format!("✓ {} visible ({})", org, role)).ok();
            }

            AuditProgress::FetchingRepos { org, .. } => {
                let pb = self.multi.add(ProgressBar::new_spinner());
                pb.set_style(Self::spinner_style());
                pb.enable_steady_tick(Duration::from_millis(100));
                pb.set_prefix(format!("{:12}", org));
                pb.set_message("Fetching repositories...");
                state.discover_bar = Some(pb);
            }

            AuditProgress::FetchedRepoPage {
                page,
                total_so_far,
                total_count,
                ..
            } => {
                if let Some(ref pb) = state.discover_bar {
                    let msg = match total_count {
                        Some(total) => format!("Page {} ({}/{} repos)", page, total_so_far, total),
                        None => format!("Page {} ({} repos)", page, total_so_far),
                    };
                    pb.set_message(msg);
                }
                let bar = self.audit_bar(&mut state);
                if !state.discovery_done {
                    bar.set_length(total_so_far as u64);
                }
            }

            AuditProgress::ReposDiscovered { total, skipped } => {
                if let Some(ref pb) = state.discover_bar {
                    let msg = if skipped > 0 {
                        format!("✓ {} repos ({} skipped)", total, skipped)
                    } else {
                        format!("✓ {} repos", total)
                    };
                    pb.finish_with_message(msg);
                }
                state.discovery_done = true;
                let bar = self.audit_bar(&mut state);
                bar.set_length(total as u64);
            }

            AuditProgress::FetchedCollaboratorPage { repo, page, .. } => {
                if page > 1
                    && let Some(ref pb) = state.audit_bar
                {
                    pb.set_message(format!("{} page {}", repo, page));
                }
            }

            AuditProgress::RepoAudited {
                repo,
                collaborators,
                done,
                known,
            } => {
                let bar = self.audit_bar(&mut state);
                if !state.discovery_done && bar.length() < Some(known as u64) {
                    bar.set_length(known as u64);
                }
                bar.set_position(done as u64);
                bar.set_message(format!("{} ({} collaborators)", repo, collaborators));
            }

            AuditProgress::RetryBackoff {
                scope,
                retry_after_ms,
                attempt,
                ..
            } => {
                if let Some(pb) = state.audit_bar.as_ref().or(state.discover_bar.as_ref()) {
                    pb.set_message(format!(
                        "⏳ {} retry {} in {:.1}s",
                        scope,
                        attempt,
                        retry_after_ms as f64 / 1000.0
                    ));
                }
            }

            AuditProgress::Anomaly { repo, detail } => {
                drop(state);
                self.multi.println(format!("⚠ {}: {}", repo, detail)).ok();
            }

            AuditProgress::Cancelling { in_flight } => {
                if let Some(ref pb) = state.audit_bar {
                    pb.set_message(format!("Cancelling, {} in flight...", in_flight));
                }
            }

            AuditProgress::Finalized {
                permission_rows,
                users,
                repositories,
            } => {
                if let Some(ref pb) = state.audit_bar {
                    pb.finish_with_message(format!(
                        "✓ {} repos, {} users, {} permissions",
                        repositories, users, permission_rows
                    ));
                }
            }

            _ => {}
        }
    }

    pub fn finish(&self) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(ref pb) = state.discover_bar
            && !pb.is_finished()
        {
            pb.finish();
        }
        if let Some(ref pb) = state.audit_bar
            && !pb.is_finished()
        {
            pb.abandon();
        }
    }

    fn spinner_style() -> ProgressStyle {
        ProgressStyle::default_spinner()
            .template("{prefix:.bold.cyan} {spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
    }

    fn bar_style() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template("{prefix:.bold.cyan} [{bar:40.cyan/blue}] {pos:>3}/{len:3} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░")
    }
}

impl Default for InteractiveReporter {
    fn default() -> Self {
        Self::new()
    }
}
