//! Dispatcher: routes each inbound message to exactly one handler and
//! produces the reply.

use chrono::NaiveDate;
use chrono_tz::Tz;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::bot::cache::{CacheStats, ResponseCache};
use crate::bot::commands::{Command, SmallTalk};
use crate::bot::cooldown::RefreshGate;
use crate::bot::dedup::Deduplicator;
use crate::bot::session::{self, Sessions, Turn};
use crate::bot::{BotError, format};
use crate::clock::Clock;
use crate::config::{Config, UserProfile, find_user};
use crate::ledger::{Ledger, LedgerError, Spreadsheet};
use crate::model::CategoryBudget;
use crate::oracle::{Completion, ExpenseDraft, ExpenseOracle, Intent};
use crate::store::TtlStore;

/// Transactions given to the model when answering a question.
const RECENT_FOR_ANSWERS: usize = 20;

/// Transactions scanned for a same-day duplicate before recording.
const RECENT_FOR_DUPLICATES: usize = 10;

/// One delivered message.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub sender: String,
    pub body: String,
    /// Transport-assigned id, used for redelivery detection.
    pub message_id: Option<String>,
    /// Transport timestamp in unix seconds.
    pub timestamp: Option<i64>,
}

impl Inbound {
    pub fn text(sender: impl Into<String>, body: impl Into<String>) -> Self {
        Self { sender: sender.into(), body: body.into(), message_id: None, timestamp: None }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }
}

/// Tunables for [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub users: Vec<UserProfile>,
    /// Zone "today" is computed in.
    pub timezone: Tz,
    pub dedup_ttl_secs: u64,
    pub dedup_bucket_secs: u64,
    pub cache_ttl_secs: u64,
    pub refresh_cooldown_secs: u64,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            users: Vec::new(),
            timezone: chrono_tz::Asia::Jerusalem,
            dedup_ttl_secs: 60,
            dedup_bucket_secs: 10,
            cache_ttl_secs: 300,
            refresh_cooldown_secs: 30,
        }
    }
}

impl From<&Config> for DispatcherSettings {
    fn from(config: &Config) -> Self {
        Self {
            users: config.users.clone(),
            timezone: config.timezone,
            dedup_ttl_secs: config.dedup_ttl_secs,
            dedup_bucket_secs: config.dedup_bucket_secs,
            cache_ttl_secs: config.cache_ttl_secs,
            refresh_cooldown_secs: config.refresh_cooldown_secs,
        }
    }
}

pub struct Dispatcher<C, S> {
    oracle: ExpenseOracle<C>,
    ledger: Ledger<S>,
    dedup: Deduplicator,
    cache: ResponseCache,
    gate: RefreshGate,
    sessions: Sessions,
    users: Vec<UserProfile>,
    timezone: Tz,
    clock: Arc<dyn Clock>,
    /// One lock per sender; a sender's messages are handled one at a time.
    sender_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<C: Completion, S: Spreadsheet> Dispatcher<C, S> {
    pub fn new(
        oracle: ExpenseOracle<C>,
        ledger: Ledger<S>,
        dedup_store: Box<dyn TtlStore>,
        cache_store: Box<dyn TtlStore>,
        clock: Arc<dyn Clock>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            oracle,
            ledger,
            dedup: Deduplicator::new(dedup_store, settings.dedup_ttl_secs, settings.dedup_bucket_secs),
            cache: ResponseCache::new(cache_store, settings.cache_ttl_secs),
            gate: RefreshGate::new(settings.refresh_cooldown_secs),
            sessions: Sessions::new(),
            users: settings.users,
            timezone: settings.timezone,
            clock,
            sender_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn ledger(&self) -> &Ledger<S> {
        &self.ledger
    }

    pub fn sessions(&self) -> &Sessions {
        &self.sessions
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn user(&self, sender: &str) -> UserProfile {
        find_user(&self.users, sender)
    }

    fn today(&self) -> NaiveDate {
        self.clock.now().with_timezone(&self.timezone).date_naive()
    }

    fn sender_lock(&self, sender: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.sender_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(sender.to_string()).or_default().clone()
    }

    /// Forget the sender's lock once no other turn holds or awaits it.
    fn release_sender_lock(&self, sender: &str, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.sender_locks.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the map, one held by the caller.
        if Arc::strong_count(lock) == 2 {
            locks.remove(sender);
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_senders(&self) -> usize {
        self.sender_locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Reply for `msg`, or `None` when it is empty or a redelivery.
    pub async fn handle(&self, msg: &Inbound) -> Option<String> {
        let text = msg.body.trim();
        if msg.sender.is_empty() || text.is_empty() {
            debug!("Ignoring message without sender or body");
            return None;
        }

        if self.dedup.seen(&msg.sender, text, msg.message_id.as_deref(), self.clock.now()) {
            info!("Dropping duplicate delivery from {}", msg.sender);
            return None;
        }

        let lock = self.sender_lock(&msg.sender);
        let reply = {
            let _turn = lock.lock().await;
            let user = self.user(&msg.sender);
            self.dispatch(&msg.sender, text, &user).await
        };
        self.release_sender_lock(&msg.sender, &lock);
        Some(reply)
    }

    async fn dispatch(&self, sender: &str, text: &str, user: &UserProfile) -> String {
        if let Some(cmd) = Command::quick(text) {
            info!("Quick command {:?} from {}", cmd, user.name);
            return self.run_command(cmd, user).await;
        }

        if let Some(cmd) = Command::detect(text) {
            info!("Natural command {:?} from {}", cmd, user.name);
            let body = self.run_command(cmd, user).await;
            return format!("{}\n\n{}", cmd.natural_prefix(&user.emoji), body);
        }

        match SmallTalk::detect(text) {
            Some(SmallTalk::Thanks) => return format::thanks(user),
            Some(SmallTalk::Greeting) => return format::greeting(user),
            None => {}
        }

        if let Some(step) = self.sessions.take(sender) {
            info!("Continuing budget setup for {} at {}", user.name, step.name());
            let stage = step.name();
            let result = session::advance(step, text, &self.oracle, &self.ledger, user).await;
            return self.settle_session(sender, stage, result);
        }

        self.classify_and_route(sender, text, user).await
    }

    /// Store the next step or drop the session. Errors always drop it.
    fn settle_session(&self, sender: &str, stage: &str, result: Result<Turn, BotError>) -> String {
        match result {
            Ok(Turn::Continue(next, reply)) => {
                debug!("Session for {} now {}", sender, next.name());
                self.sessions.put(sender, next);
                reply
            }
            Ok(Turn::Done(reply)) => {
                info!("Budget setup for {} finished", sender);
                reply
            }
            Err(e) => {
                error!("Budget setup for {} failed at {}: {}", sender, stage, e);
                format::setup_crashed()
            }
        }
    }

    async fn classify_and_route(&self, sender: &str, text: &str, user: &UserProfile) -> String {
        let categories = match self.ledger.list_categories().await {
            Ok(categories) => categories,
            Err(e) => {
                error!("Could not list categories: {}", e);
                return format::ledger_unavailable(&e);
            }
        };

        let today = self.today();
        let analysis = match self.oracle.analyze(text, &categories, today).await {
            Ok(analysis) => analysis,
            Err(e) => {
                error!("Oracle unavailable: {}", e);
                return format::oracle_unavailable();
            }
        };
        info!("Intent {:?} ({:.2}) from {}", analysis.intent, analysis.confidence, user.name);

        match analysis.intent {
            Intent::BudgetSetup => {
                let result = session::start(&self.oracle, &self.ledger, user).await;
                self.settle_session(sender, "start", result)
            }
            Intent::ExpenseEntry => match analysis.expense {
                Some(draft) => self.commit_expense(draft, &categories, user, today).await,
                None => format::fallback(user),
            },
            Intent::Question => self.answer_question(text, user).await,
            Intent::Unrecognized => format::fallback(user),
        }
    }

    async fn run_command(&self, cmd: Command, user: &UserProfile) -> String {
        match cmd {
            Command::ShowBalances => match self.ledger.get_summary().await {
                Ok(summary) => format::balances(user, &summary),
                Err(e) => {
                    warn!("Balances unavailable: {}", e);
                    format::ledger_unavailable(&e)
                }
            },
            Command::ShowCategories => match self.ledger.list_categories().await {
                Ok(names) => format::categories(&names),
                Err(e) => {
                    warn!("Categories unavailable: {}", e);
                    format::ledger_unavailable(&e)
                }
            },
            Command::ShowHelp => format::help(),
            Command::Refresh => self.refresh().await,
        }
    }

    /// Cooldown-gated full recompute. The gate is stamped before the work
    /// starts and cleared again if the work fails.
    async fn refresh(&self) -> String {
        let now = self.clock.now();
        let status = self.gate.check(&self.ledger, now).await;
        if !status.allowed {
            info!("Refresh refused, {}s of cooldown left", status.remaining_secs);
            return format::refresh_gated(status.remaining_secs, status.elapsed_secs);
        }

        if let Err(e) = self.gate.mark(&self.ledger, now).await {
            warn!("Could not stamp refresh time: {}", e);
        }

        match self.ledger.recompute_all().await {
            Ok(summary) => format::refresh_done(&summary),
            Err(e) => {
                error!("Recompute failed: {}", e);
                if let Err(clear_err) = self.gate.clear(&self.ledger).await {
                    warn!("Could not reopen refresh gate: {}", clear_err);
                }
                format::refresh_failed(&e)
            }
        }
    }

    async fn commit_expense(
        &self,
        draft: ExpenseDraft,
        categories: &[String],
        user: &UserProfile,
        today: NaiveDate,
    ) -> String {
        if !categories.iter().any(|c| *c == draft.category) {
            warn!("Rejected expense with unknown category '{}'", draft.category);
            return format::unknown_category(&draft.category);
        }

        let duplicate = self.recorded_today(&draft, today).await;

        if let Err(e) = self.ledger.append_transaction(&draft.clone().into_transaction()).await {
            error!("Expense not recorded: {}", e);
            return format::expense_failed(&e);
        }

        let balance_line = match self.settle_balance(&draft.category).await {
            Ok(budget) => format::budget_warning(&budget.name, budget.remaining, budget.allocated),
            Err(e) => {
                // The row is in; let the next refresh reconcile it right away.
                warn!("Expense recorded but balance of '{}' not updated: {}", draft.category, e);
                if let Err(clear_err) = self.gate.clear(&self.ledger).await {
                    warn!("Could not reopen refresh gate: {}", clear_err);
                }
                format::balance_pending()
            }
        };

        format::expense_recorded(user, &draft, &balance_line, duplicate)
    }

    async fn settle_balance(&self, category: &str) -> Result<CategoryBudget, LedgerError> {
        if !self.ledger.recompute_category(category).await? {
            return Err(LedgerError::MissingCategory(category.to_string()));
        }
        self.ledger
            .get_category(category)
            .await?
            .ok_or_else(|| LedgerError::MissingCategory(category.to_string()))
    }

    /// Whether an identical expense was already recorded today. Read
    /// failures count as no.
    async fn recorded_today(&self, draft: &ExpenseDraft, today: NaiveDate) -> bool {
        match self.ledger.get_recent_transactions(RECENT_FOR_DUPLICATES).await {
            Ok(recent) => recent.iter().any(|tx| {
                tx.date == today
                    && tx.category == draft.category
                    && tx.description == draft.description
                    && (tx.amount - draft.amount).abs() < 0.005
            }),
            Err(e) => {
                debug!("Duplicate check skipped: {}", e);
                false
            }
        }
    }

    async fn answer_question(&self, question: &str, user: &UserProfile) -> String {
        let summary = match self.ledger.get_summary().await {
            Ok(summary) => summary,
            Err(e) => return format::ledger_unavailable(&e),
        };
        let recent = match self.ledger.get_recent_transactions(RECENT_FOR_ANSWERS).await {
            Ok(recent) => recent,
            Err(e) => return format::ledger_unavailable(&e),
        };

        let result = self
            .cache
            .get_or_compute(question, &summary, &recent, self.clock.now(), || {
                self.oracle.answer(question, &summary, &recent)
            })
            .await;

        match result {
            Ok(answer) => {
                let stats = self.cache.stats();
                debug!(
                    "Answer cache: {} hits, {} misses, {} entries ({:.0}% hit rate)",
                    stats.hits,
                    stats.misses,
                    stats.size,
                    stats.hit_rate() * 100.0
                );
                if answer.was_cached {
                    info!("Served cached answer ({}s old)", answer.age_secs);
                }
                format::answer(user, &answer.answer, answer.was_cached)
            }
            Err(e) => {
                error!("Question not answered: {}", e);
                format::answer_failed()
            }
        }
    }
}

