//! Multi-turn budget setup: pick the period label, pick the categories,
//! confirm, provision.

use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::bot::BotError;
use crate::bot::commands::has_word;
use crate::bot::format;
use crate::config::UserProfile;
use crate::ledger::{Ledger, Spreadsheet};
use crate::model::CategoryAllocation;
use crate::oracle::{Completion, ExpenseOracle, OracleError};

const NEGATIONS: &[&str] = &["לא", "ביטול"];
const CANCEL_WORDS: &[&str] = &["ביטול", "לא", "עצור"];

/// Where a sender is in the setup dialogue.
#[derive(Debug, Clone, PartialEq)]
pub enum SetupStep {
    AwaitingConfirmation {
        suggested: String,
        current: String,
    },
    AwaitingCategories {
        label: String,
        /// Previous period's categories; empty when there were none.
        template: Vec<CategoryAllocation>,
    },
    AwaitingFinalConfirmation {
        label: String,
        categories: Vec<CategoryAllocation>,
    },
}

impl SetupStep {
    pub fn name(&self) -> &'static str {
        match self {
            SetupStep::AwaitingConfirmation { .. } => "awaiting_confirmation",
            SetupStep::AwaitingCategories { .. } => "awaiting_categories",
            SetupStep::AwaitingFinalConfirmation { .. } => "awaiting_final_confirmation",
        }
    }
}

/// Result of one dialogue turn.
#[derive(Debug, Clone, PartialEq)]
pub enum Turn {
    /// Keep the session at this step.
    Continue(SetupStep, String),
    /// Session is over (committed, cancelled or failed).
    Done(String),
}

/// Active sessions by sender.
#[derive(Debug, Default)]
pub struct Sessions {
    steps: Mutex<HashMap<String, SetupStep>>,
}

impl Sessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return the sender's session.
    pub fn take(&self, sender: &str) -> Option<SetupStep> {
        self.steps.lock().unwrap_or_else(|e| e.into_inner()).remove(sender)
    }

    pub fn put(&self, sender: &str, step: SetupStep) {
        self.steps.lock().unwrap_or_else(|e| e.into_inner()).insert(sender.to_string(), step);
    }

    pub fn contains(&self, sender: &str) -> bool {
        self.steps.lock().unwrap_or_else(|e| e.into_inner()).contains_key(sender)
    }

    pub fn get(&self, sender: &str) -> Option<SetupStep> {
        self.steps.lock().unwrap_or_else(|e| e.into_inner()).get(sender).cloned()
    }

    pub fn len(&self) -> usize {
        self.steps.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Open a setup dialogue: read the current period and ask the oracle for
/// its successor.
pub async fn start<C: Completion, S: Spreadsheet>(
    oracle: &ExpenseOracle<C>,
    ledger: &Ledger<S>,
    user: &UserProfile,
) -> Result<Turn, BotError> {
    let current = ledger.current_period().await?;
    let suggested = oracle.suggest_next_label(&current).await;
    info!("Budget setup started for {}: '{}' -> '{}'", user.name, current, suggested);

    let reply = format::setup_started(user, &current, &suggested);
    Ok(Turn::Continue(SetupStep::AwaitingConfirmation { suggested, current }, reply))
}

/// Feed one message to the dialogue.
pub async fn advance<C: Completion, S: Spreadsheet>(
    step: SetupStep,
    text: &str,
    oracle: &ExpenseOracle<C>,
    ledger: &Ledger<S>,
    user: &UserProfile,
) -> Result<Turn, BotError> {
    match step {
        SetupStep::AwaitingConfirmation { suggested, current } => {
            if has_word(text, NEGATIONS) {
                info!("Budget setup cancelled at label step");
                return Ok(Turn::Done(format::setup_cancelled(user)));
            }

            let label = if oracle.confirm(text).await? {
                suggested
            } else {
                let custom = text.trim();
                if custom.is_empty() {
                    let reply = format::setup_started(user, &current, &suggested);
                    return Ok(Turn::Continue(SetupStep::AwaitingConfirmation { suggested, current }, reply));
                }
                custom.to_string()
            };

            let template = ledger.previous_categories().await?;
            info!("Setup label '{}', {} template categories", label, template.len());
            let reply = format::setup_template(user, &label, &template);
            Ok(Turn::Continue(SetupStep::AwaitingCategories { label, template }, reply))
        }

        SetupStep::AwaitingCategories { label, template } => {
            if has_word(text, CANCEL_WORDS) {
                info!("Budget setup cancelled at categories step");
                return Ok(Turn::Done(format::setup_cancelled(user)));
            }

            let use_template = !template.is_empty() && oracle.confirm(text).await?;
            let categories = if use_template {
                template.clone()
            } else {
                match oracle.parse_budget(text).await {
                    Ok(parsed) => parsed,
                    Err(OracleError::Malformed(detail)) => {
                        warn!("Unparsable category list: {}", detail);
                        Vec::new()
                    }
                    Err(e) => return Err(e.into()),
                }
            };

            if categories.is_empty() {
                return Ok(Turn::Continue(
                    SetupStep::AwaitingCategories { label, template },
                    format::setup_no_categories(),
                ));
            }

            let reply = format::setup_summary(user, &label, &categories);
            Ok(Turn::Continue(SetupStep::AwaitingFinalConfirmation { label, categories }, reply))
        }

        SetupStep::AwaitingFinalConfirmation { label, categories } => {
            if !oracle.confirm(text).await? {
                info!("Budget setup declined at final step");
                return Ok(Turn::Done(format::setup_cancelled(user)));
            }

            match ledger.provision_period(&label, &categories).await {
                Ok(report) => Ok(Turn::Done(format::setup_completed(user, &report))),
                Err(e) => {
                    error!("Provisioning '{}' failed: {}", label, e);
                    Ok(Turn::Done(format::setup_failed(&e)))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::{MemorySheets, SheetOp};
    use crate::ledger::{Book, WORKING_SHEET_KEY};
    use crate::oracle::scripted::ScriptedCompletion;
    use crate::oracle::{AnalysisMode, Purpose};
    use std::sync::Arc;

    fn setup() -> (Arc<ScriptedCompletion>, ExpenseOracle<Arc<ScriptedCompletion>>, Ledger<MemorySheets>) {
        let scripted = Arc::new(ScriptedCompletion::new());
        let oracle = ExpenseOracle::new(scripted.clone(), AnalysisMode::Combined);
        let ledger = Ledger::new(MemorySheets::with_period("יולי", &[("קניות", 800.0), ("בידור", 300.0)]));
        (scripted, oracle, ledger)
    }

    fn user() -> UserProfile {
        UserProfile::anonymous()
    }

    fn expect_continue(turn: Turn) -> SetupStep {
        match turn {
            Turn::Continue(step, _) => step,
            Turn::Done(reply) => panic!("session ended early: {reply}"),
        }
    }

    #[tokio::test]
    async fn test_start_suggests_successor() {
        let (scripted, oracle, ledger) = setup();
        scripted.push(Purpose::SuggestLabel, "אוגוסט");

        let step = expect_continue(start(&oracle, &ledger, &user()).await.unwrap());
        assert_eq!(
            step,
            SetupStep::AwaitingConfirmation { suggested: "אוגוסט".into(), current: "יולי".into() }
        );
    }

    #[tokio::test]
    async fn test_custom_label_is_adopted_verbatim() {
        let (scripted, oracle, ledger) = setup();
        scripted.push(Purpose::Confirm, "no");
        let step = SetupStep::AwaitingConfirmation { suggested: "אוגוסט".into(), current: "יולי".into() };

        let next = expect_continue(advance(step, "ספטמבר", &oracle, &ledger, &user()).await.unwrap());
        match next {
            SetupStep::AwaitingCategories { label, template } => {
                assert_eq!(label, "ספטמבר");
                assert_eq!(template.len(), 2);
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_single_char_label_is_adopted() {
        let (scripted, oracle, ledger) = setup();
        scripted.push(Purpose::Confirm, "no");
        let step = SetupStep::AwaitingConfirmation { suggested: "אוגוסט".into(), current: "יולי".into() };

        let next = expect_continue(advance(step, " 7 ", &oracle, &ledger, &user()).await.unwrap());
        assert!(matches!(next, SetupStep::AwaitingCategories { ref label, .. } if label == "7"));
    }

    #[tokio::test]
    async fn test_negation_skips_oracle() {
        let (scripted, oracle, ledger) = setup();
        let step = SetupStep::AwaitingConfirmation { suggested: "אוגוסט".into(), current: "יולי".into() };

        let turn = advance(step, "לא תודה", &oracle, &ledger, &user()).await.unwrap();
        assert!(matches!(turn, Turn::Done(_)));
        assert_eq!(scripted.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_empty_parse_stays_in_categories() {
        let (scripted, oracle, ledger) = setup();
        scripted.push(Purpose::ParseBudget, "[]");
        scripted.push(Purpose::ParseBudget, "sorry, no idea");
        let step = SetupStep::AwaitingCategories { label: "אוגוסט".into(), template: Vec::new() };

        let again = expect_continue(advance(step.clone(), "משהו", &oracle, &ledger, &user()).await.unwrap());
        assert_eq!(again, step);
        let again = expect_continue(advance(step.clone(), "משהו", &oracle, &ledger, &user()).await.unwrap());
        assert_eq!(again, step);
        // no template, so no confirmation was asked
        assert_eq!(scripted.calls(Purpose::Confirm), 0);
    }

    #[tokio::test]
    async fn test_new_list_replaces_template() {
        let (scripted, oracle, ledger) = setup();
        scripted.push(Purpose::Confirm, "no");
        scripted.push(Purpose::ParseBudget, r#"[{"קטגוריה": "דלק", "תקציב": 400}]"#);
        let step = SetupStep::AwaitingCategories {
            label: "אוגוסט".into(),
            template: vec![CategoryAllocation::new("קניות", 800.0)],
        };

        let next = expect_continue(advance(step, "דלק 400", &oracle, &ledger, &user()).await.unwrap());
        assert_eq!(
            next,
            SetupStep::AwaitingFinalConfirmation {
                label: "אוגוסט".into(),
                categories: vec![CategoryAllocation::new("דלק", 400.0)],
            }
        );
    }

    #[tokio::test]
    async fn test_provision_failure_reports_step() {
        let (scripted, oracle, ledger) = setup();
        scripted.push(Purpose::Confirm, "yes");
        ledger.sheets().fail(SheetOp::AddSheet, Book::Budget);
        let step = SetupStep::AwaitingFinalConfirmation {
            label: "אוגוסט".into(),
            categories: vec![CategoryAllocation::new("קניות", 800.0)],
        };

        match advance(step, "אישור", &oracle, &ledger, &user()).await.unwrap() {
            Turn::Done(reply) => assert!(reply.contains("יצירת הגליונות")),
            other => panic!("unexpected turn {other:?}"),
        }
        assert_eq!(ledger.get_config(WORKING_SHEET_KEY).await.unwrap(), "יולי");
    }

    #[tokio::test]
    async fn test_transport_error_propagates() {
        let (scripted, oracle, ledger) = setup();
        scripted.push_err(Purpose::Confirm, OracleError::Timeout);
        let step = SetupStep::AwaitingFinalConfirmation { label: "אוגוסט".into(), categories: Vec::new() };

        assert!(advance(step, "אישור", &oracle, &ledger, &user()).await.is_err());
    }

    #[test]
    fn test_sessions_take_removes() {
        let sessions = Sessions::new();
        let step = SetupStep::AwaitingCategories { label: "x".into(), template: Vec::new() };
        sessions.put("972501", step.clone());
        assert!(sessions.contains("972501"));
        assert_eq!(sessions.take("972501"), Some(step));
        assert!(sessions.is_empty());
    }
}
