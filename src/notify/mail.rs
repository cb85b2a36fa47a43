//! Mail delivery through an external script, invoked as
//! `<script> <subject> <body> <mime-type> <receiver>`.

use super::Mail;
use crate::config::MailConfig;
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;

#[derive(Debug, Clone)]
pub struct MailScript {
    script: PathBuf,
}

impl MailScript {
    /// `None` when mail is disabled or the script is missing.
    pub fn from_config(cfg: &MailConfig) -> Option<Self> {
        if !cfg.enabled {
            info!("Mail notifications disabled via MAIL_ENABLED");
            return None;
        }
        let script = Path::new(cfg.script.trim());
        if cfg.script.trim().is_empty() || !script.is_file() {
            warn!("Mail script '{}' not found, mail notifications disabled", cfg.script);
            return None;
        }
        Some(MailScript {
            script: script.to_path_buf(),
        })
    }

    /// Spawns the script and reaps it on a helper thread.
    pub fn send(&self, mail: &Mail) -> Result<(), String> {
        let mut child = Command::new(&self.script)
            .arg(&mail.subject)
            .arg(&mail.body)
            .arg(&mail.mime)
            .arg(&mail.to)
            .spawn()
            .map_err(|e| format!("starting {} failed: {}", self.script.display(), e))?;
        info!("Send mail '{}' to '{}'", mail.subject, mail.to);

        let subject = mail.subject.clone();
        thread::spawn(move || match child.wait() {
            Ok(status) if status.success() => {}
            Ok(status) => warn!("Mail script for '{}' exited with {}", subject, status),
            Err(e) => warn!("Waiting for mail script failed: {}", e),
        });
        Ok(())
    }
}
