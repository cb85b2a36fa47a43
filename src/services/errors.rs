//! Mirror of the controller's error log and the fault mail.

use crate::models::device::DeviceErrorInfo;
use crate::models::telemetry::{DeviceErrorRecord, ErrorState};
use crate::notify::{Mail, Notifier};
use crate::store::{Store, StoreError};
use crate::utils::format_local;
use log::{info, warn};

pub const ERROR_MAIL_SUBJECT: &str = "Heizung: STÖRUNG";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorSync {
    pub inserted: usize,
    pub updated: usize,
    /// Errors neither acknowledged nor mailed yet.
    pub pending: usize,
}

/// Folds the device log (oldest entry first) into `device_errors`.
///
/// An "occurred" line opens an episode keyed by `(number, time)`; later
/// "gone"/"acknowledged" lines are attributed to the open episode. Lines
/// that arrive without an open episode are ignored.
pub fn update_errors<S: Store>(store: &mut S, log: &[DeviceErrorInfo]) -> Result<ErrorSync, StoreError> {
    store.transaction(|store| {
        let mut sync = ErrorSync::default();
        let mut opened_at = None;

        for line in log {
            let Some(state) = ErrorState::from_device(line.state) else {
                warn!("Device error {}: unexpected state {}", line.number, line.state);
                continue;
            };
            if state == ErrorState::Occurred {
                opened_at = Some(line.time);
            }
            let Some(time1) = opened_at else {
                continue;
            };

            let existing = store.find_device_error(line.number, time1)?;
            let applies = match &existing {
                None => true,
                Some(r) => match state {
                    ErrorState::Gone => r.state != ErrorState::Gone,
                    ErrorState::Acknowledged => r.state == ErrorState::Occurred,
                    ErrorState::Occurred => false,
                },
            };

            if applies {
                let is_new = existing.is_none();
                let mut record = existing.unwrap_or_else(|| DeviceErrorRecord {
                    id: None,
                    number: line.number,
                    info: line.info,
                    text: line.text.clone(),
                    state,
                    time1,
                    time2: None,
                    time4: None,
                    mail_count: 0,
                });
                match state {
                    ErrorState::Occurred => record.time1 = line.time,
                    ErrorState::Gone => record.time2 = Some(line.time),
                    ErrorState::Acknowledged => record.time4 = Some(line.time),
                }
                record.state = state;
                record.info = line.info;
                record.text = line.text.clone();
                store.save_device_error(&record)?;
                if is_new {
                    sync.inserted += 1;
                } else {
                    sync.updated += 1;
                }
            }

            if state == ErrorState::Gone {
                opened_at = None;
            }
        }

        sync.pending = store.load_device_errors()?.iter().filter(|e| e.is_pending()).count();
        if sync.inserted + sync.updated > 0 {
            info!(
                "Device errors: {} new, {} changed, {} pending",
                sync.inserted, sync.updated, sync.pending
            );
        }
        Ok(sync)
    })
}

fn error_table(errors: &[DeviceErrorRecord]) -> String {
    let mut html = String::from("<html>\n <body>\n  <table>\n");
    html.push_str("   <tr><th>Zeit</th><th>Fehler</th><th>Status</th></tr>\n");
    for e in errors {
        html.push_str(&format!(
            "   <tr><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            format_local(e.latest_time()),
            e.text,
            e.state.text()
        ));
    }
    html.push_str("  </table>\n </body>\n</html>\n");
    html
}

/// Mails the pending errors to `to` and marks them mailed. Returns the
/// number of errors reported; nothing is marked when the mail did not go out.
pub fn send_error_mail<S: Store, N: Notifier>(store: &mut S, notifier: &mut N, to: &str) -> Result<usize, StoreError> {
    if to.trim().is_empty() || !notifier.mail_ready() {
        return Ok(0);
    }
    let pending: Vec<_> = store.load_device_errors()?.into_iter().filter(|e| e.is_pending()).collect();
    if pending.is_empty() {
        return Ok(0);
    }

    if !notifier.send_mail(Mail::html(to, ERROR_MAIL_SUBJECT, error_table(&pending))) {
        return Ok(0);
    }
    for mut record in pending.iter().cloned() {
        record.mail_count += 1;
        store.save_device_error(&record)?;
    }
    info!("Error mail with {} entries sent to '{}'", pending.len(), to);
    Ok(pending.len())
}
