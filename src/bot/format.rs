//! User-facing reply texts.

use crate::config::UserProfile;
use crate::ledger::{ProvisionError, ProvisionReport, RecomputeSummary};
use crate::model::{CategoryAllocation, CategoryBudget, format_amount, total_allocated};
use crate::oracle::ExpenseDraft;

/// Remaining-budget line for one category. Over budget is checked first;
/// percentage bands only apply when something was allocated.
pub fn budget_warning(category: &str, remaining: f64, allocated: f64) -> String {
    if remaining < 0.0 {
        return format!("🚨 חריגה! חרגת ב-{}₪ מתקציב ‹{category}›", format_amount(-remaining));
    }
    let left = format_amount(remaining);
    if allocated <= 0.0 {
        return format!("✅ נותרו {left}₪ ב‹{category}›");
    }

    let percentage = remaining / allocated * 100.0;
    if percentage < 5.0 {
        format!("🚨 אזהרה! נותרו רק {left}₪ ב‹{category}› ({percentage:.1}%)")
    } else if percentage < 15.0 {
        format!("⚠️ תשומת לב! נותרו {left}₪ ב‹{category}› ({percentage:.1}%)")
    } else if percentage < 30.0 {
        format!("⏰ נותרו {left}₪ ב‹{category}› ({percentage:.1}%)")
    } else {
        format!("✅ נותרו {left}₪ ב‹{category}›")
    }
}

pub fn balances(user: &UserProfile, summary: &[CategoryBudget]) -> String {
    if summary.is_empty() {
        return "❌ לא נמצא מידע על התקציב".to_string();
    }
    let mut out = format!("{} **יתרות התקציב:**\n", user.emoji);
    for c in summary {
        out.push_str(&format!("• {}\n", budget_warning(&c.name, c.remaining, c.allocated)));
    }
    out
}

pub fn categories(names: &[String]) -> String {
    if names.is_empty() {
        return "❌ לא נמצאו קטגוריות בחודש הפעיל".to_string();
    }
    let lines: Vec<String> = names.iter().map(|n| format!("• {n}")).collect();
    format!("📂 **קטגוריות זמינות:**\n{}", lines.join("\n"))
}

pub fn help() -> String {
    "🤖 **מדריך שימוש:**

📝 **לרישום הוצאה:**
• \"קניתי לחם ב-12\"
• \"פלאפל 18 שקל\"
• \"שילמתי 50 על דלק\"

❓ **לשאלות:**
• \"כמה נשאר בקניות?\"
• \"מה הוצאתי השבוע?\"
• \"איך אני עומד עם התקציב?\"

🏗️ **הגדרת תקציב חדש:**
• \"רוצה ליצור תקציב חדש\"
• \"צריך תקציב חדש\"

⚡ **פקודות מהירות:**
• יתרה - יתרות כל הקטגוריות
• קטגוריות - רשימת קטגוריות
• רענון - עדכון יתרות
• עזרה - המדריך הזה

💡 **טיפים:**
• הבוט מבין דיבור טבעי
• מזהה כפילויות אוטומטית
• מקבל תאריכים בעברית"
        .to_string()
}

pub fn fallback(user: &UserProfile) -> String {
    format!(
        "🤖 {}, לא הבנתי בדיוק מה רציתם.

📝 **דוגמאות לרישום הוצאה:**
• \"קניתי לחם ב-12\"
• \"פלאפל 18₪\"
• \"דלק 200 שקל\"

❓ **דוגמאות לשאלות:**
• \"כמה נשאר בקניות?\"
• \"מה הוצאתי השבוע?\"

🏗️ **יצירת תקציב חדש:**
• \"רוצה ליצור תקציב חדש\"
• \"תקציב חדש\"

⚡ **פקודות מהירות:** יתרה, עזרה, קטגוריות

💡 נסו שוב או כתבו \"עזרה\" למדריך מלא!",
        user.name
    )
}

pub fn thanks(user: &UserProfile) -> String {
    format!("{} בכיף! יש עוד הוצאות להזין?", user.emoji)
}

pub fn greeting(user: &UserProfile) -> String {
    format!("שלום {}! {}\nאפשר לעזור לך עם התקציב?", user.name, user.emoji)
}

pub fn oracle_unavailable() -> String {
    "⚠️ שירות הבינה המלאכותית אינו זמין כרגע. אנא נסו שוב מאוחר יותר.".to_string()
}

pub fn ledger_unavailable(err: &impl std::fmt::Display) -> String {
    format!("⚠️ שגיאה בגישה לגליון התקציב: {err}")
}

pub fn unknown_category(category: &str) -> String {
    format!("⚠️ הקטגוריה '{category}' אינה קיימת בגליון התקציב.")
}

pub fn expense_recorded(user: &UserProfile, draft: &ExpenseDraft, balance_line: &str, duplicate: bool) -> String {
    let mut out = format!(
        "{} **נרשם בהצלחה!**\n📝 {} - {}₪\n💰 {}\n",
        user.emoji,
        draft.description,
        format_amount(draft.amount),
        balance_line
    );
    if duplicate {
        out.push_str(&format!(
            "\n🔄 אזהרה: נרשמה הוצאה זהה היום - {} {}₪",
            draft.description,
            format_amount(draft.amount)
        ));
    }
    out
}

/// Balance line when the expense was appended but the recompute failed.
pub fn balance_pending() -> String {
    "⏳ היתרה תתעדכן בהמשך - כתבו 'רענון' לעדכון מיידי".to_string()
}

pub fn expense_failed(err: &impl std::fmt::Display) -> String {
    format!("⚠️ שגיאה ברישום ההוצאה, ההוצאה לא נרשמה: {err}")
}

pub fn answer(user: &UserProfile, answer: &str, cached: bool) -> String {
    if cached {
        format!("{} ⚡ {answer}", user.emoji)
    } else {
        format!("{} {answer}", user.emoji)
    }
}

pub fn answer_failed() -> String {
    "⚠️ לא הצלחתי לענות כרגע. נסו שוב בעוד רגע.".to_string()
}

pub fn refresh_gated(remaining_secs: i64, elapsed_secs: Option<i64>) -> String {
    match elapsed_secs {
        Some(elapsed) => format!(
            "⏳ הרענון האחרון בוצע לפני {elapsed} שניות. אפשר לרענן שוב בעוד {remaining_secs} שניות."
        ),
        None => format!("⏳ אפשר לרענן שוב בעוד {remaining_secs} שניות."),
    }
}

pub fn refresh_done(summary: &RecomputeSummary) -> String {
    let mut out = format!(
        "🔄 **רענון הושלם!**\n✅ עודכנו {} קטגוריות בתקציב\n💰 כל הסכומים עכשיו מדויקים",
        summary.updated
    );
    if !summary.failed.is_empty() {
        out.push_str(&format!("\n⚠️ הוצאות בקטגוריות שאינן בתקציב: {}", summary.failed.join(", ")));
    }
    out
}

pub fn refresh_failed(err: &impl std::fmt::Display) -> String {
    format!("⚠️ שגיאה ברענון: {err}")
}

// Budget setup

fn allocation_lines(categories: &[CategoryAllocation]) -> String {
    categories
        .iter()
        .map(|c| format!("• {}: {}₪\n", c.name, format_amount(c.amount)))
        .collect()
}

pub fn setup_started(user: &UserProfile, current: &str, suggested: &str) -> String {
    format!(
        "{} **הגדרת תקציב חדש**

🗓️ החודש הנוכחי: {current}
💡 הצעה לחודש הבא: **{suggested}**

❓ רוצה ליצור תקציב חדש עבור \"{suggested}\"?

💬 תגובות אפשריות:
• \"כן\" - יצירת תקציב עבור {suggested}
• \"לא\" - ביטול
• שם חודש אחר - למשל \"ספטמבר\"",
        user.emoji
    )
}

pub fn setup_template(user: &UserProfile, label: &str, template: &[CategoryAllocation]) -> String {
    if template.is_empty() {
        return format!(
            "{} **הגדרת קטגוריות עבור {label}**

📝 **הזינו את הקטגוריות והסכומים:**
דוגמה: \"קניות 800, אוכל בחוץ 400, תחבורה 200, בידור 300\"",
            user.emoji
        );
    }
    format!(
        "{} **הגדרת קטגוריות עבור {label}**

📋 **קטגוריות מהחודש הקודם:**
{}
💰 **סה\"כ מוצע: {}₪**

💡 **אפשרויות:**
1️⃣ \"אישור\" - להשתמש באותן קטגוריות וסכומים
2️⃣ רשימה חדשה - למשל: \"קניות 800, אוכל בחוץ 400, תחבורה 200\"
3️⃣ \"ביטול\" - לבטל את ההגדרה",
        user.emoji,
        allocation_lines(template),
        format_amount(total_allocated(template))
    )
}

pub fn setup_no_categories() -> String {
    "❌ לא נמצאו קטגוריות תקפות. נסו שוב עם הפורמט: 'קטגוריה סכום, קטגוריה סכום'".to_string()
}

pub fn setup_summary(user: &UserProfile, label: &str, categories: &[CategoryAllocation]) -> String {
    format!(
        "{} **סיכום התקציב החדש**

📋 **חודש:** {label}
💰 **קטגוריות:**
{}
💯 **סה\"כ תקציב:** {}₪

✅ **לאישור סופי כתבו \"אישור\"**
❌ **לביטול כתבו \"ביטול\"**",
        user.emoji,
        allocation_lines(categories),
        format_amount(total_allocated(categories))
    )
}

pub fn setup_cancelled(user: &UserProfile) -> String {
    format!("{} בסדר, ביטלתי את יצירת התקציב החדש.", user.emoji)
}

pub fn setup_completed(user: &UserProfile, report: &ProvisionReport) -> String {
    format!(
        "{} 🎉 **התקציב החדש נוצר בהצלחה!**

📅 **חודש:** {}
📊 **קטגוריות:** {}
✅ **מוכן לשימוש!**

💡 **עכשיו אפשר להתחיל לרשום הוצאות:**
דוגמה: \"קניתי קפה ב-15\"",
        user.emoji, report.label, report.categories
    )
}

pub fn setup_failed(err: &ProvisionError) -> String {
    format!(
        "❌ **שגיאה ביצירת התקציב** בשלב {}:\n{}\n\nנסו שוב עם 'תקציב חדש'.",
        err.step.describe(),
        err.source
    )
}

pub fn setup_crashed() -> String {
    "⚠️ שגיאה בהגדרת התקציב. התהליך בוטל - כתבו 'תקציב חדש' כדי להתחיל מחדש.".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_bands() {
        assert!(budget_warning("A", -20.0, 100.0).starts_with("🚨 חריגה"));
        assert!(budget_warning("A", -20.0, 100.0).contains("20₪"));
        assert!(budget_warning("A", 4.0, 100.0).starts_with("🚨 אזהרה"));
        assert!(budget_warning("A", 10.0, 100.0).starts_with("⚠️"));
        assert!(budget_warning("A", 29.0, 100.0).starts_with("⏰"));
        assert!(budget_warning("A", 30.0, 100.0).starts_with("✅"));
    }

    #[test]
    fn test_zero_allocation_never_divides() {
        assert_eq!(budget_warning("A", 0.0, 0.0), "✅ נותרו 0₪ ב‹A›");
        assert!(budget_warning("A", -5.0, 0.0).starts_with("🚨 חריגה"));
        assert!(!budget_warning("A", 0.0, 0.0).contains("NaN"));
    }

    #[test]
    fn test_template_totals() {
        let user = UserProfile::anonymous();
        let text = setup_template(
            &user,
            "August",
            &[CategoryAllocation::new("קניות", 800.0), CategoryAllocation::new("בידור", 300.5)],
        );
        assert!(text.contains("• קניות: 800₪"));
        assert!(text.contains("1100.5₪"));
    }
}
