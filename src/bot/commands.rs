//! Fixed command vocabulary and keyword detection.

/// Commands reachable without the language model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ShowBalances,
    ShowCategories,
    ShowHelp,
    Refresh,
}

const QUICK: &[(&str, Command)] = &[
    ("יתרה", Command::ShowBalances),
    ("קטגוריות", Command::ShowCategories),
    ("עזרה", Command::ShowHelp),
    ("רענון", Command::Refresh),
];

// Checked in this order; first match wins.
const NATURAL: &[(Command, &[&str])] = &[
    (
        Command::ShowBalances,
        &["כמה נשאר", "מה היתרה", "תראה לי את היתרה", "מה המצב עם הכסף", "איך אני עומד", "מה יש לי", "כמה יש לי", "מה הסטטוס"],
    ),
    (
        Command::ShowCategories,
        &["איזה קטגוריות", "מה הקטגוריות", "תראה לי קטגוריות", "רשימת קטגוריות", "איזה אפשרויות", "מה אפשר", "איך מחלקים"],
    ),
    (
        Command::ShowHelp,
        &["איך זה עובד", "מה אפשר לעשות", "איך להשתמש", "מה הפקודות", "עזרה", "הדרכה", "מדריך", "איך אני משתמש"],
    ),
    (
        Command::Refresh,
        &["רענן", "עדכן", "חשב מחדש", "בדוק שוב", "תקן את המספרים", "עדכן יתרות", "תסנכרן"],
    ),
];

const THANKS: &[&str] = &["תודה", "תודה רבה", "יפה", "מעולה", "כל הכבוד"];
const GREETINGS: &[&str] = &["שלום", "היי", "הי", "מה נשמע", "מה המצב"];

impl Command {
    /// Exact trigger word, surrounding whitespace ignored.
    pub fn quick(text: &str) -> Option<Command> {
        let text = text.trim();
        QUICK.iter().find(|(word, _)| *word == text).map(|(_, cmd)| *cmd)
    }

    /// Command implied by a known phrase anywhere in the text.
    pub fn detect(text: &str) -> Option<Command> {
        let words = tokens(text);
        NATURAL
            .iter()
            .find(|(_, phrases)| phrases.iter().any(|p| contains_phrase(&words, p)))
            .map(|(cmd, _)| *cmd)
    }

    /// Conversational opener used when the command was phrased naturally.
    pub fn natural_prefix(&self, emoji: &str) -> String {
        match self {
            Command::ShowBalances => format!("{emoji} בואו נבדוק מה המצב:"),
            Command::ShowCategories => format!("{emoji} הנה הקטגוריות הזמינות:"),
            Command::ShowHelp => format!("{emoji} אני כאן לעזור! הנה מה שאפשר לעשות:"),
            Command::Refresh => format!("{emoji} בואו נרענן את הכל:"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmallTalk {
    Thanks,
    Greeting,
}

impl SmallTalk {
    pub fn detect(text: &str) -> Option<SmallTalk> {
        let words = tokens(text);
        if THANKS.iter().any(|p| contains_phrase(&words, p)) {
            Some(SmallTalk::Thanks)
        } else if GREETINGS.iter().any(|p| contains_phrase(&words, p)) {
            Some(SmallTalk::Greeting)
        } else {
            None
        }
    }
}

/// Lowercased words; punctuation separates words.
pub fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Whether `phrase` occurs in `words` as consecutive whole words.
pub fn contains_phrase(words: &[String], phrase: &str) -> bool {
    let needle = tokens(phrase);
    !needle.is_empty() && words.windows(needle.len()).any(|w| w == needle.as_slice())
}

/// Whether any of `keywords` appears as a whole word in `text`.
pub fn has_word(text: &str, keywords: &[&str]) -> bool {
    let words = tokens(text);
    keywords.iter().any(|k| contains_phrase(&words, k))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quick_is_exact() {
        assert_eq!(Command::quick(" יתרה "), Some(Command::ShowBalances));
        assert_eq!(Command::quick("רענון"), Some(Command::Refresh));
        assert_eq!(Command::quick("יתרה בבקשה"), None);
    }

    #[test]
    fn test_natural_priority() {
        assert_eq!(Command::detect("כמה נשאר בקניות?"), Some(Command::ShowBalances));
        assert_eq!(Command::detect("תראה לי קטגוריות"), Some(Command::ShowCategories));
        assert_eq!(Command::detect("איך זה עובד?"), Some(Command::ShowHelp));
        assert_eq!(Command::detect("אפשר לחשב מחדש"), None);
        assert_eq!(Command::detect("תעשה חשב מחדש"), Some(Command::Refresh));
        // balance wins over refresh
        assert_eq!(Command::detect("עדכן אותי כמה נשאר"), Some(Command::ShowBalances));
        assert_eq!(Command::detect("קניתי לחם ב-12"), None);
    }

    #[test]
    fn test_small_talk_needs_whole_words() {
        assert_eq!(SmallTalk::detect("תודה רבה!"), Some(SmallTalk::Thanks));
        assert_eq!(SmallTalk::detect("היי"), Some(SmallTalk::Greeting));
        assert_eq!(SmallTalk::detect("קניתי היום לחם"), None);
    }

    #[test]
    fn test_has_word() {
        assert!(has_word("לא תודה", &["לא"]));
        assert!(has_word("ביטול.", &["ביטול"]));
        assert!(!has_word("לאט לאט", &["לא"]));
    }
}
