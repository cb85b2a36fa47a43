//! Sensor alert rules: threshold and rate-of-change checks, boolean
//! composition through sub-rules, and repeat-suppressed mail delivery.
//!
//! Evaluation is a pure function over an [`AlertView`] loaded once per pass.
//! Only the top-level call has side effects (`last_alert_at`, mail).

use crate::models::telemetry::{AlertRule, FactKey, Peak, Sample, ValueFact};
use crate::notify::{Mail, Notifier};
use crate::store::{Store, StoreError};
use crate::utils::{format_local, format_value};
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use std::collections::HashMap;

/// Sub-rules are followed while the current depth is at most this.
pub const MAX_RULE_DEPTH: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub enum HitReason {
    Threshold,
    Delta { past: f64 },
}

/// One fired check, with everything its message template needs.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertHit {
    pub rule: AlertRule,
    pub title: String,
    pub unit: String,
    pub value: f64,
    pub peak: Option<Peak>,
    pub reason: HitReason,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Combined condition of the rule graph.
    pub verdict: bool,
    /// Verdict after repeat suppression; drives the notification.
    pub notify: bool,
    pub hits: Vec<AlertHit>,
}

impl Evaluation {
    fn quiet() -> Self {
        Evaluation {
            verdict: false,
            notify: false,
            hits: Vec::new(),
        }
    }
}

/// Rules, facts and samples needed for one evaluation pass.
#[derive(Debug, Default, Clone)]
pub struct AlertView {
    rules: HashMap<i64, AlertRule>,
    facts: HashMap<FactKey, ValueFact>,
    latest: HashMap<FactKey, Sample>,
    /// Sample near `now - range` per rule id, for delta checks.
    past: HashMap<i64, Sample>,
    peaks: HashMap<FactKey, Peak>,
}

impl AlertView {
    /// Fetches the view for `now`. `tolerance` widens the delta lookup
    /// window to cover sampling jitter (one poll interval).
    pub fn load<S: Store>(
        store: &mut S,
        facts: &[ValueFact],
        now: DateTime<Utc>,
        tolerance: Duration,
    ) -> Result<Self, StoreError> {
        let mut view = AlertView::default();
        for fact in facts.iter().filter(|f| f.active) {
            view.facts.insert(fact.key(), fact.clone());
        }
        for rule in store.load_alert_rules()? {
            let key = rule.key();
            if !view.latest.contains_key(&key)
                && let Some(sample) = store.latest_raw_sample(key, now)?
            {
                view.latest.insert(key, sample);
            }
            if !view.peaks.contains_key(&key)
                && let Some(peak) = store.find_peak(key)?
            {
                view.peaks.insert(key, peak);
            }
            if let (Some(range), Some(_)) = (rule.range_minutes, rule.delta) {
                let from = now - Duration::minutes(i64::from(range));
                if let Some(sample) = store.first_raw_sample_between(key, from, from + tolerance)? {
                    view.past.insert(rule.id, sample);
                }
            }
            view.rules.insert(rule.id, rule);
        }
        Ok(view)
    }

    pub fn insert_rule(&mut self, rule: AlertRule) {
        self.rules.insert(rule.id, rule);
    }

    pub fn insert_fact(&mut self, fact: ValueFact) {
        self.facts.insert(fact.key(), fact);
    }

    pub fn insert_sample(&mut self, sample: Sample) {
        self.latest.insert(sample.key(), sample);
    }

    pub fn insert_past_sample(&mut self, rule_id: i64, sample: Sample) {
        self.past.insert(rule_id, sample);
    }

    pub fn rule(&self, id: i64) -> Option<&AlertRule> {
        self.rules.get(&id)
    }

    /// Active rules are the top-level ones, in id order.
    pub fn top_level_rules(&self) -> Vec<&AlertRule> {
        let mut rules = self.rules.values().filter(|r| r.active).collect::<Vec<_>>();
        rules.sort_by_key(|r| r.id);
        rules
    }
}

struct DepthExceeded;

fn check(
    view: &AlertView,
    rule: &AlertRule,
    depth: usize,
    force: bool,
    hits: &mut Vec<AlertHit>,
) -> Result<bool, DepthExceeded> {
    let key = rule.key();
    let (Some(fact), Some(sample)) = (view.facts.get(&key), view.latest.get(&key)) else {
        info!("Alert rule {}: can't perform sensor check for {}, no fact or sample", rule.id, key);
        return Ok(false);
    };
    let value = sample.value;
    let hit = |reason| AlertHit {
        rule: rule.clone(),
        title: fact.display_title().to_string(),
        unit: fact.unit.clone(),
        value,
        peak: view.peaks.get(&key).copied(),
        reason,
    };

    let mut own = false;
    if rule.min.is_some() || rule.max.is_some() {
        let below = rule.min.is_some_and(|min| value < min);
        let above = rule.max.is_some_and(|max| value > max);
        if force || below || above {
            info!(
                "{}) Alert for sensor {}, value {:.2} not in range ({} - {})",
                rule.id,
                key,
                value,
                rule.min.map(format_value).unwrap_or_default(),
                rule.max.map(format_value).unwrap_or_default()
            );
            own = true;
            hits.push(hit(HitReason::Threshold));
        }
    }

    if let (Some(range), Some(delta)) = (rule.range_minutes, rule.delta) {
        match view.past.get(&rule.id) {
            Some(past) if force || (value - past.value).abs() > delta => {
                info!(
                    "{}) Alert for sensor {}, value {:.2} changed more than {} in {} minutes",
                    rule.id, key, value, delta, range
                );
                own = true;
                hits.push(hit(HitReason::Delta { past: past.value }));
            }
            Some(_) => {}
            None => debug!("Alert rule {}: no sample {} minutes back", rule.id, range),
        }
    }

    let Some(sub_id) = rule.sub_id else {
        return Ok(own);
    };
    if depth > MAX_RULE_DEPTH {
        warn!("Alert rule {}: aborting recursion after {} steps, seems to be a config error", rule.id, MAX_RULE_DEPTH);
        return Err(DepthExceeded);
    }
    let sub = match view.rules.get(&sub_id) {
        Some(sub) => check(view, sub, depth + 1, false, hits)?,
        None => {
            warn!("Alert rule {}: sub-rule {} not found", rule.id, sub_id);
            false
        }
    };
    Ok(rule.logical_op.combine(own, sub))
}

/// Evaluates `rule` as a top-level rule at `now`.
///
/// `force` fires the rule's own checks regardless of the sample value and
/// ignores repeat suppression; sub-rules are always evaluated unforced.
pub fn evaluate(view: &AlertView, rule: &AlertRule, now: DateTime<Utc>, force: bool) -> Evaluation {
    let mut hits = Vec::new();
    let Ok(verdict) = check(view, rule, 0, force, &mut hits) else {
        return Evaluation::quiet();
    };
    let window = Duration::minutes(i64::from(rule.max_repeat_minutes.max(0)));
    let suppressed = rule.last_alert_at.is_some_and(|last| last >= now - window);
    Evaluation {
        verdict,
        notify: verdict && (force || !suppressed),
        hits,
    }
}

fn render(template: &str, hit: &AlertHit, now: DateTime<Utc>, web_url: &str) -> String {
    let rule = &hit.rule;
    let bound = |b: Option<f64>| b.map(format_value).unwrap_or_default();
    let (minv, maxv) = hit.peak.map(|p| (p.min, p.max)).unwrap_or_default();
    template
        .replace("%sensorid%", &format!("{}/0x{:x}", rule.kind, rule.address))
        .replace("%value%", &format_value(hit.value))
        .replace("%unit%", &hit.unit)
        .replace("%title%", &hit.title)
        .replace("%min%", &bound(rule.min))
        .replace("%max%", &bound(rule.max))
        .replace("%range%", &rule.range_minutes.unwrap_or_default().to_string())
        .replace("%delta%", &bound(rule.delta))
        .replace("%time%", &format_local(now))
        .replace("%repeat%", &rule.max_repeat_minutes.to_string())
        .replace("%weburl%", web_url)
        .replace("%minv%", &format_value(minv))
        .replace("%maxv%", &format_value(maxv))
}

/// Builds the alert mail for the hits of one evaluation.
pub fn compose_mail(to: &str, hits: &[AlertHit], now: DateTime<Utc>, web_url: &str) -> Mail {
    let mut subject = String::new();
    let mut body = String::new();
    for hit in hits {
        subject.push(' ');
        subject.push_str(&render(&hit.rule.subject, hit, now, web_url));
        body.push('\n');
        let text = if hit.rule.body.is_empty() { "- undefined -" } else { hit.rule.body.as_str() };
        body.push_str(&render(text, hit, now, web_url));
    }
    if body.is_empty() {
        body.push_str("- undefined -");
    }
    let html = format!(
        "<html>\n <body>\n  {}\n </body>\n</html>\n",
        body.trim_start().replace('\n', "<br/>\n")
    );
    Mail::html(to, subject.trim(), html)
}

pub struct AlertEngine {
    web_url: String,
    tolerance: Duration,
}

impl AlertEngine {
    pub fn new(web_url: impl Into<String>, poll_interval: std::time::Duration) -> Self {
        AlertEngine {
            web_url: web_url.into(),
            tolerance: Duration::from_std(poll_interval).unwrap_or_else(|_| Duration::minutes(1)),
        }
    }

    fn deliver<S: Store, N: Notifier>(
        &self,
        store: &mut S,
        notifier: &mut N,
        rule: &AlertRule,
        evaluation: &Evaluation,
        now: DateTime<Utc>,
        force: bool,
    ) -> Result<bool, StoreError> {
        if !force {
            store.set_last_alert(rule.id, now)?;
        }
        let mail = compose_mail(&rule.mail_to, &evaluation.hits, now, &self.web_url);
        let sent = notifier.send_mail(mail);
        if !sent {
            warn!("Alert rule {}: mail to '{}' was not sent", rule.id, rule.mail_to);
        }
        Ok(sent)
    }

    /// Evaluates every top-level rule; returns the number of alert mails sent.
    pub fn check_all<S: Store, N: Notifier>(
        &self,
        store: &mut S,
        facts: &[ValueFact],
        notifier: &mut N,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let view = AlertView::load(store, facts, now, self.tolerance)?;
        let mut delivered = 0;
        for rule in view.top_level_rules() {
            let evaluation = evaluate(&view, rule, now, false);
            if evaluation.verdict && !evaluation.notify {
                debug!("Alert rule {}: suppressed, last alert {:?}", rule.id, rule.last_alert_at);
            }
            if evaluation.notify && self.deliver(store, notifier, rule, &evaluation, now, false)? {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Forced evaluation of one rule at the newest sample time. `None` when
    /// the rule does not exist.
    pub fn test_rule<S: Store, N: Notifier>(
        &self,
        store: &mut S,
        facts: &[ValueFact],
        notifier: &mut N,
        rule_id: i64,
    ) -> Result<Option<Evaluation>, StoreError> {
        let now = store.latest_sample_time()?.unwrap_or_else(Utc::now);
        let view = AlertView::load(store, facts, now, self.tolerance)?;
        let Some(rule) = view.rule(rule_id) else {
            return Ok(None);
        };
        let evaluation = evaluate(&view, rule, now, true);
        if evaluation.notify {
            self.deliver(store, notifier, rule, &evaluation, now, true)?;
        }
        Ok(Some(evaluation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::telemetry::{Aggregate, FactKind, LogicalOp};
    use crate::services::samples::record;
    use crate::store::memory::MemoryStore;
    use crate::testing::RecordingNotifier;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn fact(address: i32) -> ValueFact {
        ValueFact {
            id: i64::from(address),
            address,
            kind: FactKind::AnalogValue,
            name: format!("s{}", address),
            title: format!("Sensor {}", address),
            usr_title: None,
            unit: "°C".into(),
            factor: 1,
            active: true,
            group_id: None,
            max_scale: Some(300),
        }
    }

    fn rule(id: i64, address: i32, min: f64, max: f64) -> AlertRule {
        AlertRule {
            id,
            address,
            kind: FactKind::AnalogValue,
            active: true,
            min: Some(min),
            max: Some(max),
            range_minutes: None,
            delta: None,
            sub_id: None,
            logical_op: LogicalOp::And,
            max_repeat_minutes: 60,
            last_alert_at: None,
            mail_to: "ops@example.org".into(),
            subject: "%title% alert".into(),
            body: "%sensorid% is %value%%unit% (%min% - %max%)".into(),
        }
    }

    fn sample(address: i32, value: f64, time: DateTime<Utc>) -> Sample {
        Sample {
            time,
            address,
            kind: FactKind::AnalogValue,
            aggregate: Aggregate::Raw,
            value,
            text: None,
            samples: 1,
        }
    }

    fn view_with(values: &[(i32, f64)]) -> AlertView {
        let mut view = AlertView::default();
        for (address, value) in values {
            view.insert_fact(fact(*address));
            view.insert_sample(sample(*address, *value, now()));
        }
        view
    }

    #[test]
    fn threshold_verdicts() {
        let r = rule(1, 1, 10.0, 20.0);
        let hot = evaluate(&view_with(&[(1, 25.0)]), &r, now(), false);
        assert!(hot.verdict && hot.notify);
        assert_eq!(hot.hits.len(), 1);

        let fine = evaluate(&view_with(&[(1, 15.0)]), &r, now(), false);
        assert!(!fine.verdict && !fine.notify);
        assert!(fine.hits.is_empty());
    }

    #[test]
    fn recent_alert_suppresses_notification_only() {
        let mut r = rule(1, 1, 10.0, 20.0);
        r.last_alert_at = Some(now() - Duration::seconds(1));
        let ev = evaluate(&view_with(&[(1, 25.0)]), &r, now(), false);
        assert!(ev.verdict);
        assert!(!ev.notify);

        let forced = evaluate(&view_with(&[(1, 25.0)]), &r, now(), true);
        assert!(forced.notify);

        r.last_alert_at = Some(now() - Duration::minutes(61));
        assert!(evaluate(&view_with(&[(1, 25.0)]), &r, now(), false).notify);
    }

    #[test]
    fn sub_rule_composition() {
        let mut view = view_with(&[(1, 25.0), (2, 3.0)]);
        let mut b = rule(2, 2, 4.0, 5.0);
        b.active = false;
        view.insert_rule(b);

        let mut a = rule(1, 1, 10.0, 20.0);
        a.sub_id = Some(2);
        a.logical_op = LogicalOp::And;
        assert!(evaluate(&view, &a, now(), false).verdict);

        a.logical_op = LogicalOp::AndNot;
        assert!(!evaluate(&view, &a, now(), false).verdict);

        a.logical_op = LogicalOp::OrNot;
        assert!(evaluate(&view, &a, now(), false).verdict);
    }

    #[test]
    fn missing_data_is_not_alertable() {
        let view = view_with(&[]);
        let ev = evaluate(&view, &rule(1, 9, 10.0, 20.0), now(), true);
        assert!(!ev.verdict && !ev.notify);
    }

    #[test]
    fn deep_or_cyclic_chains_abort_quietly() {
        let mut cyclic = rule(1, 1, 10.0, 20.0);
        cyclic.sub_id = Some(1);
        cyclic.logical_op = LogicalOp::Or;
        let mut view = view_with(&[(1, 25.0)]);
        view.insert_rule(cyclic.clone());
        let ev = evaluate(&view, &cyclic, now(), false);
        assert!(!ev.verdict && !ev.notify);

        // A chain whose last link sits one level past the limit.
        let build_chain = |len: i64| {
            let mut view = view_with(&[(1, 25.0)]);
            for id in 1..=len {
                let mut r = rule(id, 1, 10.0, 20.0);
                r.sub_id = (id < len).then_some(id + 1);
                view.insert_rule(r);
            }
            view
        };
        let too_deep = build_chain(MAX_RULE_DEPTH as i64 + 3);
        let top = too_deep.rule(1).cloned().expect("top");
        assert!(!evaluate(&too_deep, &top, now(), false).verdict);

        let fits = build_chain(MAX_RULE_DEPTH as i64 + 2);
        let top = fits.rule(1).cloned().expect("top");
        assert!(evaluate(&fits, &top, now(), false).verdict);
    }

    #[test]
    fn delta_check_uses_sample_from_range_start() {
        let mut r = rule(1, 1, 0.0, 100.0);
        r.range_minutes = Some(10);
        r.delta = Some(5.0);
        let mut view = view_with(&[(1, 60.0)]);
        view.insert_past_sample(1, sample(1, 50.0, now() - Duration::minutes(10)));
        let ev = evaluate(&view, &r, now(), false);
        assert!(ev.verdict);
        assert_eq!(ev.hits[0].reason, HitReason::Delta { past: 50.0 });

        view.insert_past_sample(1, sample(1, 57.0, now() - Duration::minutes(10)));
        assert!(!evaluate(&view, &r, now(), false).verdict);
    }

    #[test]
    fn templates_fill_placeholders() {
        let r = rule(1, 0x1a, 10.0, 20.0);
        let hit = AlertHit {
            rule: r,
            title: "Kessel".into(),
            unit: "°C".into(),
            value: 25.0,
            peak: Some(Peak {
                address: 0x1a,
                kind: FactKind::AnalogValue,
                min: 4.5,
                max: 88.0,
            }),
            reason: HitReason::Threshold,
        };
        let text = render("%sensorid% %value%%unit% [%min%..%max%] peaks %minv%/%maxv% %weburl%", &hit, now(), "http://p4");
        assert_eq!(text, "VA/0x1a 25°C [10..20] peaks 4.5/88 http://p4");

        let mail = compose_mail("ops@example.org", &[hit], now(), "");
        assert_eq!(mail.subject, "Kessel alert");
        assert!(mail.body.contains("VA/0x1a is 25°C (10 - 20)"));
    }

    #[test]
    fn check_all_delivers_once_per_repeat_window() {
        let mut store = MemoryStore::connected();
        let mut notifier = RecordingNotifier::default();
        let engine = AlertEngine::new("", std::time::Duration::from_secs(60));
        let facts = vec![fact(1)];
        record(&mut store, now(), FactKey::new(1, FactKind::AnalogValue), 25.0, 1, None).expect("record");
        store.add_rule(rule(1, 1, 10.0, 20.0));
        let mut inactive = rule(2, 1, 10.0, 20.0);
        inactive.active = false;
        store.add_rule(inactive);

        assert_eq!(engine.check_all(&mut store, &facts, &mut notifier, now()).expect("first"), 1);
        assert_eq!(store.rule(1).and_then(|r| r.last_alert_at), Some(now()));
        assert_eq!(notifier.mails.len(), 1);

        let later = now() + Duration::minutes(5);
        assert_eq!(engine.check_all(&mut store, &facts, &mut notifier, later).expect("second"), 0);
        assert_eq!(notifier.mails.len(), 1);
    }

    #[test]
    fn unsent_alert_mail_is_not_counted_but_still_arms_suppression() {
        let mut store = MemoryStore::connected();
        let mut notifier = RecordingNotifier {
            mail_ready: false,
            ..Default::default()
        };
        let engine = AlertEngine::new("", std::time::Duration::from_secs(60));
        record(&mut store, now(), FactKey::new(1, FactKind::AnalogValue), 25.0, 1, None).expect("record");
        store.add_rule(rule(1, 1, 10.0, 20.0));

        assert_eq!(engine.check_all(&mut store, &[fact(1)], &mut notifier, now()).expect("check"), 0);
        assert!(notifier.mails.is_empty());
        assert_eq!(store.rule(1).and_then(|r| r.last_alert_at), Some(now()));
    }

    #[test]
    fn test_rule_forces_without_touching_last_alert() {
        let mut store = MemoryStore::connected();
        let mut notifier = RecordingNotifier::default();
        let engine = AlertEngine::new("", std::time::Duration::from_secs(60));
        record(&mut store, now(), FactKey::new(1, FactKind::AnalogValue), 15.0, 1, None).expect("record");
        store.add_rule(rule(1, 1, 10.0, 20.0));

        let ev = engine
            .test_rule(&mut store, &[fact(1)], &mut notifier, 1)
            .expect("test")
            .expect("rule exists");
        assert!(ev.notify);
        assert_eq!(notifier.mails.len(), 1);
        assert_eq!(store.rule(1).and_then(|r| r.last_alert_at), None);
        assert!(engine.test_rule(&mut store, &[fact(1)], &mut notifier, 99).expect("test").is_none());
    }
}
