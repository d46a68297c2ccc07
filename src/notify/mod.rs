use std::sync::Arc;

use crate::db::Repository;
use crate::error::Result;
use crate::models::{ChangeEvent, ChangeType, Notice, Recipient};

/// One recipient's failed delivery. Collected and returned, never raised.
#[derive(Debug)]
pub struct DeliveryError {
    pub recipient: Recipient,
    pub message: String,
}

/// The message-transport collaborator seam. The chat platform behind it is
/// out of scope; the binary ships a console transport.
#[allow(async_fn_in_trait)]
pub trait Transport {
    async fn send(&self, recipient: &Recipient, message: &str) -> anyhow::Result<()>;
}

/// Renders facts into fixed textual templates and dispatches them to every
/// configured recipient independently. Delivery is at-least-once at the
/// transport; the stored notified flag flips at most once.
pub struct Notifier<T: Transport> {
    transport: T,
    repo: Arc<Repository>,
    recipients: Vec<Recipient>,
}

impl<T: Transport> Notifier<T> {
    pub fn new(transport: T, repo: Arc<Repository>, recipients: Vec<Recipient>) -> Self {
        Self {
            transport,
            repo,
            recipients,
        }
    }

    pub async fn notify_notice(
        &self,
        notice: &Notice,
        site_name: &str,
    ) -> Result<Vec<DeliveryError>> {
        let message = render_notice(notice, site_name);
        let failures = self.dispatch(&message).await;
        self.repo.mark_notice_notified(notice.id.clone()).await?;
        Ok(failures)
    }

    pub async fn notify_change(&self, event: &ChangeEvent) -> Result<Vec<DeliveryError>> {
        let message = render_change(event);
        let failures = self.dispatch(&message).await;
        self.repo.mark_change_notified(event.id).await?;
        Ok(failures)
    }

    /// One attempt per recipient; a failure never blocks the others.
    async fn dispatch(&self, message: &str) -> Vec<DeliveryError> {
        let mut failures = Vec::new();
        for recipient in &self.recipients {
            if let Err(e) = self.transport.send(recipient, message).await {
                tracing::warn!("delivery to {} failed: {}", recipient, e);
                failures.push(DeliveryError {
                    recipient: recipient.clone(),
                    message: e.to_string(),
                });
            }
        }
        failures
    }
}

fn render_notice(notice: &Notice, site_name: &str) -> String {
    format!(
        "📢 新通知\n【{}】{}\n日期: {}\n链接: {}",
        site_name, notice.title, notice.publish_date, notice.url
    )
}

fn render_change(event: &ChangeEvent) -> String {
    let day = day_name(event.day_of_week);
    let detail = match event.change_type {
        ChangeType::Added => format!("新增课程: {}", event.new_value.as_deref().unwrap_or("?")),
        ChangeType::Removed => format!("取消课程: {}", event.old_value.as_deref().unwrap_or("?")),
        ChangeType::Modified => format!(
            "课程调整: {} → {}",
            event.old_value.as_deref().unwrap_or("?"),
            event.new_value.as_deref().unwrap_or("?")
        ),
    };
    format!(
        "📅 课表变动提醒 ({})\n第{}周 {} 第{}节\n{}",
        event.subject_id, event.week, day, event.section_code, detail
    )
}

fn day_name(day_of_week: u8) -> &'static str {
    match day_of_week {
        1 => "周一",
        2 => "周二",
        3 => "周三",
        4 => "周四",
        5 => "周五",
        6 => "周六",
        7 => "周日",
        _ => "周?",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewNotice;
    use chrono::Utc;
    use tokio::sync::Mutex;

    struct MockTransport {
        sent: Mutex<Vec<(Recipient, String)>>,
        fail_for: Option<Recipient>,
    }

    impl MockTransport {
        fn new(fail_for: Option<Recipient>) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail_for,
            }
        }
    }

    impl Transport for MockTransport {
        async fn send(&self, recipient: &Recipient, message: &str) -> anyhow::Result<()> {
            if self.fail_for.as_ref() == Some(recipient) {
                anyhow::bail!("recipient unreachable");
            }
            self.sent
                .lock()
                .await
                .push((recipient.clone(), message.to_string()));
            Ok(())
        }
    }

    async fn test_repo() -> (tempfile::TempDir, Arc<Repository>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let repo = Repository::new(path.to_str().unwrap()).await.unwrap();
        (dir, Arc::new(repo))
    }

    async fn stored_notice(repo: &Repository) -> Notice {
        let candidate = NewNotice {
            site_id: "main".to_string(),
            title: "关于期末考试安排的通知".to_string(),
            url: "https://www.nimt.edu.cn/739/k.htm".to_string(),
            publish_date: "2024-06-20".to_string(),
        };
        repo.insert_notice_if_new(candidate).await.unwrap();
        repo.recent_notices(1).await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn delivers_to_all_recipients_and_marks_once() {
        let (_dir, repo) = test_repo().await;
        let notice = stored_notice(&repo).await;
        let recipients = vec![
            Recipient::User("1001".to_string()),
            Recipient::Group("2002".to_string()),
        ];
        let notifier = Notifier::new(MockTransport::new(None), repo.clone(), recipients);

        let failures = notifier.notify_notice(&notice, "学校官网").await.unwrap();
        assert!(failures.is_empty());
        assert_eq!(notifier.transport.sent.lock().await.len(), 2);
        assert!(repo.unnotified_notices().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn one_failure_does_not_block_others() {
        let (_dir, repo) = test_repo().await;
        let notice = stored_notice(&repo).await;
        let bad = Recipient::User("1001".to_string());
        let recipients = vec![bad.clone(), Recipient::Group("2002".to_string())];
        let notifier = Notifier::new(MockTransport::new(Some(bad.clone())), repo.clone(), recipients);

        let failures = notifier.notify_notice(&notice, "学校官网").await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].recipient, bad);
        // The healthy recipient still got the message.
        assert_eq!(notifier.transport.sent.lock().await.len(), 1);
        // Partial delivery still flips the flag, exactly once.
        assert!(repo.unnotified_notices().await.unwrap().is_empty());
    }

    #[test]
    fn change_templates_cover_all_kinds() {
        let mut event = ChangeEvent {
            id: 1,
            subject_id: "2023001".to_string(),
            academic_year: "2024-2025".to_string(),
            week: 7,
            day_of_week: 2,
            section_code: "03".to_string(),
            change_type: ChangeType::Modified,
            old_value: Some("大学英语 张老师".to_string()),
            new_value: Some("大学英语 李老师".to_string()),
            change_date: "2024-06-20".to_string(),
            detected_at: Utc::now(),
            notified: false,
        };
        let msg = render_change(&event);
        assert!(msg.contains("第7周"));
        assert!(msg.contains("周二"));
        assert!(msg.contains("张老师 → 大学英语 李老师"));

        event.change_type = ChangeType::Added;
        assert!(render_change(&event).contains("新增课程"));
        event.change_type = ChangeType::Removed;
        assert!(render_change(&event).contains("取消课程"));
    }
}
