//! Expense oracle: everything the bot asks of the language model.
//!
//! The oracle owns prompt construction and parsing of model output; the
//! model itself sits behind [`Completion`] so tests can script answers.
//! Transport failures propagate as [`OracleError`]; malformed output from
//! [`ExpenseOracle::analyze`] degrades to [`Intent::Unrecognized`] instead.

pub mod openai;
mod prompts;
pub mod scripted;

use chrono::NaiveDate;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

use crate::model::{CategoryAllocation, CategoryBudget, Transaction};
use crate::retry::Transient;

pub use openai::OpenAiClient;

/// Label used when no successor label can be obtained from the model.
pub const FALLBACK_PERIOD_LABEL: &str = "חודש חדש";

const DEFAULT_MAX_TOKENS: u32 = 512;

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("request timed out")]
    Timeout,
    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("malformed model output: {0}")]
    Malformed(String),
    #[error("empty response")]
    Empty,
}

impl Transient for OracleError {
    fn is_transient(&self) -> bool {
        match self {
            OracleError::Http(_) | OracleError::Timeout => true,
            OracleError::Api { status, .. } => *status == 429 || *status >= 500,
            OracleError::Malformed(_) | OracleError::Empty => false,
        }
    }
}

/// What a completion call is for. Backends ignore it; test doubles script
/// answers by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    Classify,
    ExtractExpense,
    Analyze,
    Answer,
    ParseBudget,
    Confirm,
    SuggestLabel,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub purpose: Purpose,
    pub instruction: String,
    /// Few-shot (user, assistant) pairs placed between instruction and text.
    pub examples: Vec<(String, String)>,
    pub user_text: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl CompletionRequest {
    fn new(purpose: Purpose, instruction: String, user_text: impl Into<String>, temperature: f32) -> Self {
        Self {
            purpose,
            instruction,
            examples: Vec::new(),
            user_text: user_text.into(),
            temperature,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    fn with_examples(mut self, examples: Vec<(String, String)>) -> Self {
        self.examples = examples;
        self
    }
}

/// Text-completion backend. Returns the raw model text.
pub trait Completion: Send + Sync {
    fn complete(&self, request: &CompletionRequest) -> impl Future<Output = Result<String, OracleError>> + Send;
}

impl<T: Completion + ?Sized> Completion for std::sync::Arc<T> {
    fn complete(&self, request: &CompletionRequest) -> impl Future<Output = Result<String, OracleError>> + Send {
        (**self).complete(request)
    }
}

/// How [`ExpenseOracle::analyze`] talks to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnalysisMode {
    /// One call returns intent, confidence and expense fields together.
    #[default]
    Combined,
    /// Classification, then extraction when the intent is an expense.
    Separate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    ExpenseEntry,
    Question,
    BudgetSetup,
    Unrecognized,
}

impl Intent {
    pub fn from_label(label: &str) -> Self {
        let label = label.trim().trim_matches(|c: char| c == '"' || c == '\'' || c == '.').to_lowercase();
        match label.as_str() {
            "budget_entry" | "expense_entry" => Intent::ExpenseEntry,
            "question" => Intent::Question,
            "budget_setup" => Intent::BudgetSetup,
            _ => Intent::Unrecognized,
        }
    }
}

/// Expense fields extracted from free text. The category is whatever the
/// model said; callers validate it against the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpenseDraft {
    pub category: String,
    pub description: String,
    pub amount: f64,
    pub date: NaiveDate,
}

impl ExpenseDraft {
    pub fn into_transaction(self) -> Transaction {
        Transaction {
            category: self.category,
            description: self.description,
            amount: self.amount,
            date: self.date,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub intent: Intent,
    /// In `[0, 1]`.
    pub confidence: f64,
    /// Present only for [`Intent::ExpenseEntry`].
    pub expense: Option<ExpenseDraft>,
}

impl Analysis {
    fn unrecognized() -> Self {
        Self { intent: Intent::Unrecognized, confidence: 0.0, expense: None }
    }
}

pub struct ExpenseOracle<C> {
    completion: C,
    mode: AnalysisMode,
}

impl<C: Completion> ExpenseOracle<C> {
    pub fn new(completion: C, mode: AnalysisMode) -> Self {
        Self { completion, mode }
    }

    pub fn mode(&self) -> AnalysisMode {
        self.mode
    }

    pub async fn classify(&self, text: &str, categories: &[String]) -> Result<Intent, OracleError> {
        let request = CompletionRequest::new(Purpose::Classify, prompts::classify(categories), text, 0.1);
        let raw = self.completion.complete(&request).await?;
        let intent = Intent::from_label(&raw);
        debug!("Classified as {:?} (raw: {:?})", intent, raw);
        Ok(intent)
    }

    /// Structured expense from free text. Relative dates resolve against
    /// `today`; a missing or unreadable date becomes `today`.
    pub async fn extract_expense(
        &self,
        text: &str,
        categories: &[String],
        today: NaiveDate,
    ) -> Result<ExpenseDraft, OracleError> {
        let request = CompletionRequest::new(
            Purpose::ExtractExpense,
            prompts::extract_expense(categories, today),
            text,
            0.0,
        )
        .with_examples(prompts::expense_examples(today));

        let raw = self.completion.complete(&request).await?;
        let value = extract_json(&raw)?;
        parse_expense(&value, today)
    }

    /// Intent plus, for expenses, the extracted fields. Both modes return
    /// the same shape; invalid model output yields `Unrecognized` with zero
    /// confidence.
    pub async fn analyze(&self, text: &str, categories: &[String], today: NaiveDate) -> Result<Analysis, OracleError> {
        match self.mode {
            AnalysisMode::Combined => self.analyze_combined(text, categories, today).await,
            AnalysisMode::Separate => self.analyze_separate(text, categories, today).await,
        }
    }

    async fn analyze_combined(
        &self,
        text: &str,
        categories: &[String],
        today: NaiveDate,
    ) -> Result<Analysis, OracleError> {
        let request = CompletionRequest::new(Purpose::Analyze, prompts::analyze(categories, today), text, 0.1);
        let raw = self.completion.complete(&request).await?;

        let value = match extract_json(&raw) {
            Ok(v) => v,
            Err(e) => {
                warn!("Combined analysis unreadable: {}", e);
                return Ok(Analysis::unrecognized());
            }
        };

        let intent = value
            .get("message_type")
            .and_then(Value::as_str)
            .map(Intent::from_label)
            .unwrap_or(Intent::Unrecognized);
        if intent == Intent::Unrecognized {
            return Ok(Analysis::unrecognized());
        }

        let confidence = value
            .get("confidence")
            .and_then(number_of)
            .filter(|c| c.is_finite())
            .map(|c| c.clamp(0.0, 1.0))
            .unwrap_or(0.0);

        if intent != Intent::ExpenseEntry {
            return Ok(Analysis { intent, confidence, expense: None });
        }

        let expense = value.get("expense_data").map(|data| parse_expense(data, today));
        match expense {
            Some(Ok(draft)) => Ok(Analysis { intent, confidence, expense: Some(draft) }),
            Some(Err(e)) => {
                warn!("Combined analysis carried an invalid expense: {}", e);
                Ok(Analysis::unrecognized())
            }
            None => {
                warn!("Combined analysis is an expense without expense_data");
                Ok(Analysis::unrecognized())
            }
        }
    }

    async fn analyze_separate(
        &self,
        text: &str,
        categories: &[String],
        today: NaiveDate,
    ) -> Result<Analysis, OracleError> {
        let intent = self.classify(text, categories).await?;
        match intent {
            Intent::Unrecognized => Ok(Analysis::unrecognized()),
            Intent::Question | Intent::BudgetSetup => Ok(Analysis { intent, confidence: 1.0, expense: None }),
            Intent::ExpenseEntry => match self.extract_expense(text, categories, today).await {
                Ok(draft) => Ok(Analysis { intent, confidence: 1.0, expense: Some(draft) }),
                Err(OracleError::Malformed(e)) => {
                    warn!("Expense extraction unreadable: {}", e);
                    Ok(Analysis::unrecognized())
                }
                Err(e) => Err(e),
            },
        }
    }

    /// Free-text answer grounded in the given summary and transactions.
    pub async fn answer(
        &self,
        question: &str,
        summary: &[CategoryBudget],
        recent: &[Transaction],
    ) -> Result<String, OracleError> {
        let request = CompletionRequest::new(Purpose::Answer, prompts::answer(summary, recent), question, 0.3);
        self.completion.complete(&request).await
    }

    /// Category/amount pairs from free text. Entries without a name or with
    /// an unreadable amount are dropped; an empty result is not an error.
    pub async fn parse_budget(&self, text: &str) -> Result<Vec<CategoryAllocation>, OracleError> {
        let request = CompletionRequest::new(Purpose::ParseBudget, prompts::parse_budget(), text, 0.0);
        let raw = self.completion.complete(&request).await?;
        let value = extract_json(&raw)?;

        let items = match value {
            Value::Array(items) => items,
            Value::Object(ref map) => match map.values().find(|v| v.is_array()) {
                Some(Value::Array(items)) => items.clone(),
                _ => return Err(OracleError::Malformed("expected a JSON array".to_string())),
            },
            _ => return Err(OracleError::Malformed("expected a JSON array".to_string())),
        };

        let allocations: Vec<CategoryAllocation> = items
            .iter()
            .filter_map(|item| {
                let name = item.get("קטגוריה")?.as_str()?.trim();
                let amount = item.get("תקציב").and_then(number_of)?;
                (!name.is_empty() && amount.is_finite() && amount >= 0.0)
                    .then(|| CategoryAllocation::new(name, amount))
            })
            .collect();

        info!("Parsed {} budget categories", allocations.len());
        Ok(allocations)
    }

    /// True only on an unambiguous "yes".
    pub async fn confirm(&self, text: &str) -> Result<bool, OracleError> {
        let request = CompletionRequest::new(Purpose::Confirm, prompts::confirm(), text, 0.0);
        let raw = self.completion.complete(&request).await?;
        let answer = raw.trim().trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase();
        Ok(answer == "yes")
    }

    /// Successor of `current` (e.g. the next month). Never fails: falls back
    /// to [`FALLBACK_PERIOD_LABEL`] when the model is unavailable.
    pub async fn suggest_next_label(&self, current: &str) -> String {
        let request = CompletionRequest::new(
            Purpose::SuggestLabel,
            prompts::suggest_label(),
            format!("החודש הנוכחי: {current}"),
            0.0,
        );
        match self.completion.complete(&request).await {
            Ok(raw) => {
                let label = raw.trim().trim_matches(|c: char| c == '"' || c == '\'').trim();
                if label.is_empty() {
                    FALLBACK_PERIOD_LABEL.to_string()
                } else {
                    label.to_string()
                }
            }
            Err(e) => {
                warn!("Label suggestion failed, using fallback: {}", e);
                FALLBACK_PERIOD_LABEL.to_string()
            }
        }
    }
}

static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").expect("valid regex"));

/// Parse the JSON payload out of model text, tolerating code fences and
/// prose around a single object or array.
pub fn extract_json(raw: &str) -> Result<Value, OracleError> {
    let body = CODE_FENCE
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(raw)
        .trim();

    if let Ok(value) = serde_json::from_str::<Value>(body) {
        return Ok(value);
    }

    if let (Some(start), Some(end)) = (body.find(['{', '[']), body.rfind(['}', ']'])) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<Value>(&body[start..=end]) {
                return Ok(value);
            }
        }
    }

    Err(OracleError::Malformed(format!("not JSON: {}", truncate(raw, 80))))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}…")
    }
}

/// Numbers may arrive as JSON numbers or as strings like "45₪" or "1,200".
fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            cleaned.parse().ok()
        }
        _ => None,
    }
}

#[derive(Deserialize)]
struct RawExpense {
    #[serde(rename = "קטגוריה", default)]
    category: Option<String>,
    #[serde(rename = "פירוט", default)]
    description: Option<String>,
    #[serde(rename = "מחיר", default)]
    amount: Option<Value>,
    #[serde(rename = "תאריך", default)]
    date: Option<String>,
}

fn parse_expense(value: &Value, today: NaiveDate) -> Result<ExpenseDraft, OracleError> {
    let raw: RawExpense =
        serde_json::from_value(value.clone()).map_err(|e| OracleError::Malformed(e.to_string()))?;

    let category = raw
        .category
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .ok_or_else(|| OracleError::Malformed("missing category".to_string()))?;

    let amount = raw
        .amount
        .as_ref()
        .and_then(number_of)
        .ok_or_else(|| OracleError::Malformed("missing amount".to_string()))?;
    if !amount.is_finite() || amount <= 0.0 {
        return Err(OracleError::Malformed(format!("non-positive amount {amount}")));
    }

    let date = raw
        .date
        .as_deref()
        .and_then(|d| NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d").ok())
        .unwrap_or(today);

    Ok(ExpenseDraft {
        category,
        description: raw.description.map(|d| d.trim().to_string()).unwrap_or_default(),
        amount,
        date,
    })
}

#[cfg(test)]
mod tests {
    use super::scripted::ScriptedCompletion;
    use super::*;
    use std::sync::Arc;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, 14).unwrap()
    }

    fn cats() -> Vec<String> {
        vec!["קניות".to_string(), "אוכל בחוץ".to_string()]
    }

    fn oracle(mode: AnalysisMode) -> (Arc<ScriptedCompletion>, ExpenseOracle<Arc<ScriptedCompletion>>) {
        let script = Arc::new(ScriptedCompletion::new());
        (script.clone(), ExpenseOracle::new(script, mode))
    }

    #[test]
    fn test_intent_labels() {
        assert_eq!(Intent::from_label("budget_entry"), Intent::ExpenseEntry);
        assert_eq!(Intent::from_label(" Question\n"), Intent::Question);
        assert_eq!(Intent::from_label("\"budget_setup\""), Intent::BudgetSetup);
        assert_eq!(Intent::from_label("error"), Intent::Unrecognized);
        assert_eq!(Intent::from_label("other"), Intent::Unrecognized);
    }

    #[test]
    fn test_extract_json_variants() {
        assert_eq!(extract_json("{\"a\": 1}").unwrap()["a"], 1);
        assert_eq!(extract_json("```json\n{\"a\": 2}\n```").unwrap()["a"], 2);
        assert_eq!(extract_json("here you go: [1, 2] thanks").unwrap()[1], 2);
        assert!(matches!(extract_json("no json here"), Err(OracleError::Malformed(_))));
    }

    #[test]
    fn test_transient_classification() {
        assert!(OracleError::Timeout.is_transient());
        assert!(OracleError::Api { status: 503, body: String::new() }.is_transient());
        assert!(OracleError::Api { status: 429, body: String::new() }.is_transient());
        assert!(!OracleError::Api { status: 401, body: String::new() }.is_transient());
        assert!(!OracleError::Malformed(String::new()).is_transient());
    }

    #[tokio::test]
    async fn test_extract_expense_defaults_date_to_today() {
        let (script, oracle) = oracle(AnalysisMode::Separate);
        script.push(Purpose::ExtractExpense, r#"{"קטגוריה": "קניות", "פירוט": "לחם", "מחיר": "12₪"}"#);

        let draft = oracle.extract_expense("קניתי לחם ב-12", &cats(), today()).await.unwrap();
        assert_eq!(draft.category, "קניות");
        assert_eq!(draft.description, "לחם");
        assert_eq!(draft.amount, 12.0);
        assert_eq!(draft.date, today());

        let request = &script.requests()[0];
        assert_eq!(request.examples.len(), 5);
        assert!(request.instruction.contains("2025-07-14"));
    }

    #[tokio::test]
    async fn test_extract_expense_rejects_non_positive_amount() {
        let (script, oracle) = oracle(AnalysisMode::Separate);
        script.push(Purpose::ExtractExpense, r#"{"קטגוריה": "קניות", "פירוט": "החזר", "מחיר": 0}"#);
        let err = oracle.extract_expense("החזר", &cats(), today()).await.unwrap_err();
        assert!(matches!(err, OracleError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_combined_and_separate_agree() {
        let expense = r#"{"קטגוריה": "אוכל בחוץ", "פירוט": "פיצה", "מחיר": 45, "תאריך": "2025-07-13"}"#;

        let (combined_script, combined) = oracle(AnalysisMode::Combined);
        combined_script.push(
            Purpose::Analyze,
            format!(r#"```json
{{"message_type": "budget_entry", "confidence": 0.93, "expense_data": {expense}}}
```"#),
        );

        let (separate_script, separate) = oracle(AnalysisMode::Separate);
        separate_script.push(Purpose::Classify, "budget_entry");
        separate_script.push(Purpose::ExtractExpense, expense);

        let a = combined.analyze("פיצה 45 אתמול", &cats(), today()).await.unwrap();
        let b = separate.analyze("פיצה 45 אתמול", &cats(), today()).await.unwrap();

        assert_eq!(a.intent, Intent::ExpenseEntry);
        assert_eq!(a.intent, b.intent);
        assert_eq!(a.expense, b.expense);
        assert!((a.confidence - 0.93).abs() < 1e-9);
        assert!((0.0..=1.0).contains(&b.confidence));
        assert_eq!(a.expense.unwrap().date, NaiveDate::from_ymd_opt(2025, 7, 13).unwrap());
    }

    #[tokio::test]
    async fn test_combined_garbage_degrades_to_unrecognized() {
        let (script, oracle) = oracle(AnalysisMode::Combined);
        script.push(Purpose::Analyze, "sorry, I can't help with that");
        let analysis = oracle.analyze("???", &cats(), today()).await.unwrap();
        assert_eq!(analysis, Analysis::unrecognized());

        script.push(Purpose::Analyze, r#"{"message_type": "budget_entry", "confidence": 0.8, "expense_data": {"פירוט": "x"}}"#);
        let analysis = oracle.analyze("x", &cats(), today()).await.unwrap();
        assert_eq!(analysis.intent, Intent::Unrecognized);
        assert_eq!(analysis.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_analyze_propagates_transport_errors() {
        let (script, oracle) = oracle(AnalysisMode::Combined);
        script.push_err(Purpose::Analyze, OracleError::Timeout);
        assert!(matches!(oracle.analyze("x", &cats(), today()).await, Err(OracleError::Timeout)));
    }

    #[tokio::test]
    async fn test_confirm_is_conservative() {
        let (script, oracle) = oracle(AnalysisMode::Combined);
        script.push(Purpose::Confirm, "Yes.");
        script.push(Purpose::Confirm, "maybe");
        script.push(Purpose::Confirm, "no");
        assert!(oracle.confirm("בטח").await.unwrap());
        assert!(!oracle.confirm("נראה").await.unwrap());
        assert!(!oracle.confirm("לא").await.unwrap());
    }

    #[tokio::test]
    async fn test_parse_budget_tolerates_string_amounts() {
        let (script, oracle) = oracle(AnalysisMode::Combined);
        script.push(
            Purpose::ParseBudget,
            r#"[{"קטגוריה": "קניות", "תקציב": "800"}, {"קטגוריה": "בידור", "תקציב": 300}, {"קטגוריה": "", "תקציב": 5}]"#,
        );
        let parsed = oracle.parse_budget("קניות 800 ובידור 300").await.unwrap();
        assert_eq!(parsed, vec![CategoryAllocation::new("קניות", 800.0), CategoryAllocation::new("בידור", 300.0)]);
    }

    #[tokio::test]
    async fn test_suggest_label_falls_back() {
        let (script, oracle) = oracle(AnalysisMode::Combined);
        script.push(Purpose::SuggestLabel, "אוגוסט");
        script.push_err(Purpose::SuggestLabel, OracleError::Timeout);
        assert_eq!(oracle.suggest_next_label("יולי").await, "אוגוסט");
        assert_eq!(oracle.suggest_next_label("יולי").await, FALLBACK_PERIOD_LABEL);
    }
}
