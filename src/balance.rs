//! Pause/resume gate driven by the photo service's account balance.
//!
//! The gate is the only owner of the pause flag and the last observed balance.
//! Callers observe balances and ask for a decision; they never flip the flag.

use crate::notify::{Channel, InteractiveAction, Notification, Notifier};
use reqwest::Url;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::{info, warn};

pub const RESUME_PATH: &str = "/balance/resume";

const PAUSE_MESSAGE: &str = "🚨 Парсер на паузе\n\
Баланс фотосервиса 0 — публикации остановлены, нужно пополнить баланс.\n\
После пополнения нажмите кнопку, чтобы продолжить процесс.";
const RESUME_BUTTON: &str = "✅ Баланс пополнен, продолжить";
const MANUAL_RESUME_MESSAGE: &str = "✅ Баланс фотосервиса пополнен, публикации возобновлены.";
const AUTO_RESUME_MESSAGE: &str = "ℹ️ Баланс фотосервиса обновлён, публикации возобновлены.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Active,
    Paused,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BalanceState {
    pub paused: bool,
    pub last_observed: Option<f64>,
}

impl BalanceState {
    pub fn gate_state(&self) -> GateState {
        if self.paused {
            GateState::Paused
        } else {
            GateState::Active
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Paused,
    AutoResumed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateDecision {
    pub proceed: bool,
    pub transition: Option<Transition>,
}

#[derive(Debug, Error, PartialEq)]
#[error("publication paused, photo service balance is {}", describe(.balance))]
pub struct Blocked {
    pub balance: Option<f64>,
}

pub struct BalanceGate {
    state: Mutex<BalanceState>,
    resume_action: Option<InteractiveAction>,
}

impl BalanceGate {
    pub fn new(resume_action: Option<InteractiveAction>) -> Self {
        Self {
            state: Mutex::new(BalanceState::default()),
            resume_action,
        }
    }

    pub fn snapshot(&self) -> BalanceState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn last_observed_balance(&self) -> Option<f64> {
        self.snapshot().last_observed
    }

    /// Records `balance` and decides whether the current owner may proceed.
    ///
    /// `None` means the service did not report a balance; it never pauses or
    /// resumes on its own.
    pub fn observe(&self, balance: Option<f64>) -> GateDecision {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.last_observed = balance;
        match (state.paused, balance) {
            (false, Some(value)) if value == 0.0 => {
                state.paused = true;
                GateDecision {
                    proceed: false,
                    transition: Some(Transition::Paused),
                }
            }
            (true, Some(value)) if value > 0.0 => {
                state.paused = false;
                GateDecision {
                    proceed: true,
                    transition: Some(Transition::AutoResumed),
                }
            }
            (paused, _) => GateDecision {
                proceed: !paused,
                transition: None,
            },
        }
    }

    /// Observes `balance`, announces any transition, and fails while paused.
    pub async fn check(&self, balance: Option<f64>, notifier: &dyn Notifier) -> Result<(), Blocked> {
        let decision = self.observe(balance);
        match decision.transition {
            Some(Transition::Paused) => {
                warn!(target = "reconciler.balance", balance = ?balance, "publication_paused");
                notifier
                    .send(
                        Channel::Log,
                        Notification::text(PAUSE_MESSAGE).with_action(self.resume_action.clone()),
                    )
                    .await;
            }
            Some(Transition::AutoResumed) => {
                info!(target = "reconciler.balance", balance = ?balance, "publication_auto_resumed");
                notifier.log(AUTO_RESUME_MESSAGE).await;
            }
            None => {}
        }
        if decision.proceed {
            Ok(())
        } else {
            Err(Blocked { balance })
        }
    }

    /// Operator override: resumes regardless of the last observed balance.
    ///
    /// Returns the state the gate was in before the call.
    pub async fn manual_resume(&self, notifier: &dyn Notifier) -> GateState {
        let previous = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let previous = state.gate_state();
            state.paused = false;
            previous
        };
        info!(target = "reconciler.balance", previous = ?previous, "publication_manually_resumed");
        notifier.log(MANUAL_RESUME_MESSAGE).await;
        previous
    }
}

/// Resume button for the pause notice; needs both a public base URL and a token.
pub fn resume_action(public_base_url: Option<&str>, token: Option<&str>) -> Option<InteractiveAction> {
    let base = public_base_url?.trim().trim_end_matches('/');
    let token = token?.trim();
    if base.is_empty() || token.is_empty() {
        return None;
    }
    let mut url = Url::parse(base).ok()?.join(RESUME_PATH).ok()?;
    url.set_query(Some(&format!("token={}", urlencoding::encode(token))));
    Some(InteractiveAction {
        label: RESUME_BUTTON.to_string(),
        url: url.to_string(),
    })
}

fn describe(balance: &Option<f64>) -> String {
    describe_balance(*balance)
}

pub fn describe_balance(balance: Option<f64>) -> String {
    balance
        .map(|value| value.to_string())
        .unwrap_or_else(|| "нет данных".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::testing::RecordingNotifier;

    #[tokio::test]
    async fn balance_sequence_pauses_once_and_resumes_once() {
        let gate = BalanceGate::new(None);
        let notifier = RecordingNotifier::default();
        let mut states = Vec::new();
        let mut outcomes = Vec::new();
        for balance in [5.0, 0.0, 0.0, 3.0] {
            outcomes.push(gate.check(Some(balance), &notifier).await.is_ok());
            states.push(gate.snapshot().gate_state());
        }
        assert_eq!(
            states,
            vec![
                GateState::Active,
                GateState::Paused,
                GateState::Paused,
                GateState::Active
            ]
        );
        assert_eq!(outcomes, vec![true, false, false, true]);
        assert_eq!(notifier.count_containing(Channel::Log, "на паузе"), 1);
        assert_eq!(notifier.count_containing(Channel::Log, "обновлён"), 1);
        assert_eq!(gate.last_observed_balance(), Some(3.0));
    }

    #[tokio::test]
    async fn manual_resume_ignores_zero_balance() {
        let gate = BalanceGate::new(None);
        let notifier = RecordingNotifier::default();
        assert!(gate.check(Some(0.0), &notifier).await.is_err());
        assert_eq!(gate.manual_resume(&notifier).await, GateState::Paused);
        let state = gate.snapshot();
        assert_eq!(state.gate_state(), GateState::Active);
        assert_eq!(state.last_observed, Some(0.0));
        assert_eq!(notifier.count_containing(Channel::Log, "пополнен, публикации"), 1);
    }

    #[tokio::test]
    async fn unknown_balance_keeps_current_state() {
        let gate = BalanceGate::new(None);
        let notifier = RecordingNotifier::default();
        assert!(gate.check(None, &notifier).await.is_ok());
        assert!(gate.check(Some(0.0), &notifier).await.is_err());
        let blocked = gate.check(None, &notifier).await.unwrap_err();
        assert_eq!(blocked, Blocked { balance: None });
        assert_eq!(gate.snapshot().gate_state(), GateState::Paused);
        assert_eq!(gate.last_observed_balance(), None);
    }

    #[test]
    fn observe_reports_transitions() {
        let gate = BalanceGate::new(None);
        assert_eq!(gate.observe(Some(0.0)).transition, Some(Transition::Paused));
        assert_eq!(gate.observe(Some(0.0)).transition, None);
        assert_eq!(
            gate.observe(Some(1.5)).transition,
            Some(Transition::AutoResumed)
        );
    }

    #[tokio::test]
    async fn pause_notice_carries_resume_button() {
        let action = resume_action(Some("https://parser.example.com/"), Some("s3cret&x"));
        let gate = BalanceGate::new(action);
        let notifier = RecordingNotifier::default();
        let _ = gate.check(Some(0.0), &notifier).await;
        let sent = notifier.sent();
        let button = sent[0].1.action.clone().expect("button");
        assert_eq!(
            button.url,
            "https://parser.example.com/balance/resume?token=s3cret%26x"
        );
    }

    #[test]
    fn resume_action_needs_both_parts() {
        assert!(resume_action(None, Some("t")).is_none());
        assert!(resume_action(Some("https://x"), None).is_none());
        assert!(resume_action(Some("https://x"), Some("  ")).is_none());
    }

    #[test]
    fn blocked_message_mentions_balance() {
        assert!(Blocked { balance: Some(0.0) }.to_string().contains('0'));
        assert!(Blocked { balance: None }.to_string().contains("нет данных"));
    }
}
