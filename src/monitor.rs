use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use futures::stream::{self, StreamExt};

use crate::config::Config;
use crate::db::Repository;
use crate::error::{FetchError, Result};
use crate::models::{CourseRecord, Notice, Recipient};
use crate::notice::SiteFetcher;
use crate::notify::{Notifier, Transport};
use crate::portal::{SessionManager, TimetableClient};

/// Max concurrent per-subject timetable refreshes.
const MAX_CONCURRENT_REFRESHES: usize = 3;

/// Drives one check cycle at a time. All entry points are idempotent and
/// safe to invoke concurrently with themselves: the store's insert-if-absent
/// and single-transaction reconcile primitives are the only cross-run
/// coordination.
pub struct Monitor<T: Transport> {
    config: Config,
    repo: Arc<Repository>,
    fetcher: SiteFetcher,
    sessions: SessionManager,
    timetable: TimetableClient,
    notifier: Notifier<T>,
}

impl<T: Transport> Monitor<T> {
    pub async fn new(config: Config, transport: T) -> Result<Self> {
        let repo = Arc::new(Repository::new(&config.db_path).await?);
        let fetcher = SiteFetcher::new(config.portal.timeout_secs)?;
        let sessions = SessionManager::new(
            config.portal.clone(),
            config.subjects.clone(),
            repo.clone(),
        )?;
        let timetable = TimetableClient::new(config.portal.clone())?;

        let mut recipients: Vec<Recipient> = config
            .push
            .users
            .iter()
            .map(|u| Recipient::User(u.clone()))
            .collect();
        recipients.extend(config.push.groups.iter().map(|g| Recipient::Group(g.clone())));
        let notifier = Notifier::new(transport, repo.clone(), recipients);

        Ok(Self {
            config,
            repo,
            fetcher,
            sessions,
            timetable,
            notifier,
        })
    }

    /// Checks every enabled notice site once and delivers whatever turned
    /// out to be new. One site's failure degrades to "no new facts" for that
    /// site; the cycle continues.
    pub async fn check_all_sites(&self) -> Result<u32> {
        let mut total_new = 0u32;
        let mut first = true;

        for site in self.config.sites.iter().filter(|s| s.enabled) {
            if !first {
                tokio::time::sleep(Duration::from_millis(self.config.fetch_delay_ms)).await;
            }
            first = false;

            let candidates = match self.fetcher.fetch_site(site).await {
                Ok(candidates) => candidates,
                Err(e) => {
                    tracing::warn!("site {} check failed: {}", site.id, e);
                    continue;
                }
            };

            let mut site_new = 0u32;
            for candidate in candidates {
                match self.repo.insert_notice_if_new(candidate).await {
                    Ok(true) => site_new += 1,
                    Ok(false) => {}
                    Err(e) => tracing::warn!("failed to store notice for {}: {}", site.id, e),
                }
            }
            if site_new > 0 {
                tracing::info!("site {} found {} new notices", site.name, site_new);
            }
            total_new += site_new;
        }

        self.deliver_pending_notices().await?;

        if total_new > 0 {
            tracing::info!("check cycle found {} new notices in total", total_new);
        }
        Ok(total_new)
    }

    /// Delivers every stored-but-unnotified notice. Re-running after a crash
    /// picks up the backlog without double-sending already-flagged facts.
    async fn deliver_pending_notices(&self) -> Result<()> {
        for notice in self.repo.unnotified_notices().await? {
            let site_name = self.site_name(&notice);
            match self.notifier.notify_notice(&notice, &site_name).await {
                Ok(failures) => {
                    for f in failures {
                        tracing::warn!(
                            "notice {} not delivered to {}: {}",
                            notice.id,
                            f.recipient,
                            f.message
                        );
                    }
                }
                Err(e) => tracing::warn!("notifying notice {} failed: {}", notice.id, e),
            }
        }
        Ok(())
    }

    fn site_name(&self, notice: &Notice) -> String {
        self.config
            .sites
            .iter()
            .find(|s| s.id == notice.site_id)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| notice.site_id.clone())
    }

    /// Refreshes one subject's timetable for the given week and records any
    /// detected changes. Returns the number of change events produced.
    pub async fn refresh_timetable(&self, subject_id: &str, week: u32) -> Result<usize> {
        let session = self.sessions.ensure_active(subject_id).await?;
        let records = match self.timetable.fetch_week(&session, week).await {
            Ok(records) => records,
            Err(e @ FetchError::Status(_)) => {
                // A rejected authenticated request means the cookies are
                // dead; drop them so the next cycle logs in afresh.
                self.sessions.invalidate(subject_id).await;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        let academic_year = self.config.portal.academic_year.clone();
        let count = self
            .repo
            .reconcile_week(subject_id.to_string(), academic_year, week, records)
            .await?;
        if count > 0 {
            tracing::info!("subject {} week {}: {} timetable changes", subject_id, week, count);
        }
        Ok(count)
    }

    /// Runs change detection over every bound subject for the current week,
    /// then delivers pending change events. Auth failures are surfaced per
    /// subject and never abort the cycle.
    pub async fn detect_changes_all(&self) -> Result<usize> {
        let week = self.current_week();
        let subjects: Vec<String> = self
            .config
            .subjects
            .iter()
            .map(|s| s.subject_id.clone())
            .collect();

        let detected: usize = stream::iter(subjects)
            .map(|subject_id| async move {
                match self.refresh_timetable(&subject_id, week).await {
                    Ok(count) => count,
                    Err(e) => {
                        tracing::warn!("timetable check for {} failed: {}", subject_id, e);
                        0
                    }
                }
            })
            .buffer_unordered(MAX_CONCURRENT_REFRESHES)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .sum();

        for event in self.repo.unnotified_change_events().await? {
            match self.notifier.notify_change(&event).await {
                Ok(failures) => {
                    for f in failures {
                        tracing::warn!(
                            "change {} not delivered to {}: {}",
                            event.id,
                            f.recipient,
                            f.message
                        );
                    }
                }
                Err(e) => tracing::warn!("notifying change {} failed: {}", event.id, e),
            }
        }
        Ok(detected)
    }

    /// An on-demand read reuses the stored snapshot; it fetches only when no
    /// snapshot exists for the requested week.
    pub async fn week_view(&self, subject_id: &str, week: u32) -> Result<Vec<CourseRecord>> {
        let academic_year = self.config.portal.academic_year.clone();
        let stored = self
            .repo
            .week_snapshot(subject_id.to_string(), academic_year.clone(), week)
            .await?;
        if !stored.is_empty() {
            return Ok(stored);
        }
        self.refresh_timetable(subject_id, week).await?;
        self.repo
            .week_snapshot(subject_id.to_string(), academic_year, week)
            .await
    }

    pub async fn recent_notices(&self, limit: u32) -> Result<Vec<Notice>> {
        self.repo.recent_notices(limit).await
    }

    pub async fn notices_since(&self, cutoff: String) -> Result<Vec<Notice>> {
        self.repo.notices_since(cutoff).await
    }

    pub async fn notice_counts(&self) -> Result<(i64, Vec<(String, i64)>)> {
        self.repo.notice_counts().await
    }

    pub async fn purge_notices(&self) -> Result<usize> {
        self.repo.purge_notices().await
    }

    /// Teaching week derived from the configured semester start, clamped to
    /// week 1 before the semester begins.
    pub fn current_week(&self) -> u32 {
        current_week_from(&self.config.portal.semester_start, Local::now().date_naive())
    }
}

fn current_week_from(semester_start: &str, today: NaiveDate) -> u32 {
    let Ok(start) = NaiveDate::parse_from_str(semester_start, "%Y-%m-%d") else {
        return 1;
    };
    let days = (today - start).num_days();
    if days < 0 {
        return 1;
    }
    (days / 7) as u32 + 1
}
