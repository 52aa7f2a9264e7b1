//! Canned bot replies: the one-shot auto-response to a visitor's first
//! message and the fixed texts of the closure flow.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCategory {
    Problem,
    Payment,
    Download,
    General,
}

// Checked in this order; the first family with a hit wins.
const KEYWORD_FAMILIES: [(ReplyCategory, &[&str]); 3] = [
    (
        ReplyCategory::Problem,
        &["مشكلة", "مشكله", "خطأ", "عطل", "problem", "error"],
    ),
    (
        ReplyCategory::Payment,
        &["دفع", "شراء", "سعر", "payment", "purchase"],
    ),
    (
        ReplyCategory::Download,
        &["تحميل", "تنزيل", "ملف", "download", "file"],
    ),
];

impl ReplyCategory {
    /// Case-sensitive substring match against the keyword families.
    pub fn classify(content: &str) -> Self {
        KEYWORD_FAMILIES
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| content.contains(k)))
            .map(|(category, _)| *category)
            .unwrap_or(ReplyCategory::General)
    }

    pub fn reply(self) -> &'static str {
        match self {
            ReplyCategory::Problem => {
                "نأسف لمواجهتك هذه المشكلة. يرجى وصفها بالتفصيل وسيتواصل معك أحد موظفي الدعم في أقرب وقت."
            }
            ReplyCategory::Payment => {
                "بخصوص الدفع والشراء: نقبل عدة وسائل دفع آمنة. إذا واجهت مشكلة في عملية الدفع أرسل رقم الطلب وسنساعدك فوراً."
            }
            ReplyCategory::Download => {
                "يمكنك تحميل مشترياتك من صفحة طلباتي بعد تسجيل الدخول. إذا لم يعمل رابط التحميل أخبرنا برقم الطلب."
            }
            ReplyCategory::General => {
                "شكراً لتواصلك معنا! تم استلام رسالتك وسيرد عليك أحد موظفي الدعم قريباً."
            }
        }
    }
}

/// The auto-response fires only for the visitor's first message in a session.
pub fn should_auto_respond(prior_user_messages: usize) -> bool {
    prior_user_messages == 0
}

pub fn auto_response(first_message: &str) -> &'static str {
    ReplyCategory::classify(first_message).reply()
}

pub const FAREWELL: &str = "تم إنهاء المحادثة. شكراً لتواصلك معنا، نتمنى لك يوماً سعيداً!";

pub const RATING_PROMPT: &str = "تم إنهاء المحادثة. نرجو تقييم تجربتك مع فريق الدعم.";

pub const RATING_THANKS: &str = "شكراً لتقييمك! رأيك يساعدنا على تحسين خدماتنا.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_matching_family_wins() {
        assert_eq!(
            ReplyCategory::classify("عندي مشكلة في الدفع"),
            ReplyCategory::Problem
        );
        assert_eq!(
            ReplyCategory::classify("كيف أقوم بالدفع؟"),
            ReplyCategory::Payment
        );
        assert_eq!(
            ReplyCategory::classify("payment for the download failed"),
            ReplyCategory::Payment
        );
        assert_eq!(
            ReplyCategory::classify("لا أستطيع تحميل الملف"),
            ReplyCategory::Download
        );
        assert_eq!(ReplyCategory::classify("مرحبا"), ReplyCategory::General);
    }

    #[test]
    fn matching_is_case_sensitive() {
        assert_eq!(ReplyCategory::classify("ERROR 500"), ReplyCategory::General);
        assert_eq!(ReplyCategory::classify("an error"), ReplyCategory::Problem);
    }

    #[test]
    fn only_the_first_visitor_message_triggers() {
        assert!(should_auto_respond(0));
        assert!(!should_auto_respond(1));
        assert!(!should_auto_respond(2));
    }
}
