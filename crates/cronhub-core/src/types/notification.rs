//! Notification preferences and the message handed to a notifier.

use serde::{Deserialize, Serialize};

use super::execution::{ExecutionLog, ExecutionResult};

/// E-mail recipients. `to`, `cc` and `bcc` are comma-separated lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MailRecipients {
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub cc: Option<String>,
    #[serde(default)]
    pub bcc: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
}

fn split_addresses(list: &str) -> Vec<String> {
    list.split([',', ';'])
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(String::from)
        .collect()
}

impl MailRecipients {
    pub fn to_list(&self) -> Vec<String> {
        split_addresses(&self.to)
    }

    pub fn cc_list(&self) -> Vec<String> {
        self.cc.as_deref().map(split_addresses).unwrap_or_default()
    }

    pub fn bcc_list(&self) -> Vec<String> {
        self.bcc.as_deref().map(split_addresses).unwrap_or_default()
    }

    pub fn has_primary(&self) -> bool {
        !self.to_list().is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NotificationSettings {
    #[serde(default)]
    pub on_success: bool,
    #[serde(default)]
    pub on_failure: bool,
    #[serde(default)]
    pub include_output: bool,
    /// Cap on included output/error text, in bytes.
    #[serde(default)]
    pub max_output_size: Option<usize>,
    /// Body template with `{{placeholder}}` substitution.
    #[serde(default)]
    pub custom_template: Option<String>,
}

impl NotificationSettings {
    pub fn wants(&self, result: ExecutionResult) -> bool {
        match result {
            ExecutionResult::Success => self.on_success,
            ExecutionResult::Failure => self.on_failure,
        }
    }
}

/// Everything a notifier needs to deliver one message.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NotificationRequest {
    pub task_id: String,
    pub task_name: String,
    pub log: ExecutionLog,
    pub recipients: MailRecipients,
    pub settings: NotificationSettings,
    pub subject: String,
    pub body: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_lists() {
        let r = MailRecipients {
            to: "ops@example.com, dev@example.com;".into(),
            cc: Some(" lead@example.com ".into()),
            bcc: None,
            reply_to: None,
        };
        assert_eq!(r.to_list(), vec!["ops@example.com", "dev@example.com"]);
        assert_eq!(r.cc_list(), vec!["lead@example.com"]);
        assert!(r.bcc_list().is_empty());
        assert!(r.has_primary());
        assert!(!MailRecipients::default().has_primary());
    }

    #[test]
    fn test_wants() {
        let s = NotificationSettings {
            on_failure: true,
            ..Default::default()
        };
        assert!(s.wants(ExecutionResult::Failure));
        assert!(!s.wants(ExecutionResult::Success));
    }
}
