use serde::{Deserialize, Serialize};

/// Languages the bot answers in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    En,
    Ru,
}

impl Locale {
    /// Map a platform language code (`"ru"`, `"en-GB"`, ...) to a supported
    /// locale. Anything that is not Russian gets English.
    pub fn from_language_code(code: &str) -> Self {
        let primary = code.split(['-', '_']).next().unwrap_or_default();
        if primary.eq_ignore_ascii_case("ru") {
            Locale::Ru
        } else {
            Locale::En
        }
    }
}

impl Default for Locale {
    fn default() -> Self {
        Locale::En
    }
}

/// Texts sent to the user over the course of a conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Wait,
    TooLarge,
    Error,
}

pub fn text(key: MessageKey, locale: Locale) -> &'static str {
    match (key, locale) {
        (MessageKey::Error, Locale::En) => {
            "⚠️ Something went wrong. Wrong file format or internal server error."
        }
        (MessageKey::Error, Locale::Ru) => {
            "⚠️ Что-то пошло не так. Неверный формат файла или ошибка сервера."
        }
        (MessageKey::TooLarge, Locale::En) => {
            "The video you sent is too large. Please send a smaller file."
        }
        (MessageKey::TooLarge, Locale::Ru) => {
            "Отправленное вами видео слишком большое. Пожалуйста, отправьте файл поменьше."
        }
        (MessageKey::Wait, Locale::En) => "Your video note is being generated, please wait…",
        (MessageKey::Wait, Locale::Ru) => "Ваш кружок генерируется, пожалуйста, подождите…",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEYS: [MessageKey; 3] = [MessageKey::Wait, MessageKey::TooLarge, MessageKey::Error];

    #[test]
    fn test_locale_selection() {
        assert_eq!(Locale::from_language_code("ru"), Locale::Ru);
        assert_eq!(Locale::from_language_code("RU"), Locale::Ru);
        assert_eq!(Locale::from_language_code("ru-RU"), Locale::Ru);
        assert_eq!(Locale::from_language_code("en"), Locale::En);
        assert_eq!(Locale::from_language_code("de"), Locale::En);
        assert_eq!(Locale::from_language_code(""), Locale::En);
    }

    #[test]
    fn test_every_key_has_distinct_translations() {
        for key in KEYS {
            let en = text(key, Locale::En);
            let ru = text(key, Locale::Ru);
            assert!(!en.is_empty() && !ru.is_empty(), "{key:?} has an empty text");
            assert_ne!(en, ru, "{key:?} is not translated");
        }
    }
}
