use crate::log;
use crate::log::LogLevel;

// TODO Take the options string from the boot arguments once the platform code passes them to the dispatcher
pub static OPTIONS_STR: &str = match option_env!("TEE_THREAD_OPTIONS") {
    Some(s) => s,
    None => ""
};

/// A parsed view of a whitespace-separated `key` / `key=value` options string. Values may be quoted with `"` or `'`.
///
/// Parsing is done lazily on every lookup so that no allocation is needed; when a key appears more than once the last occurrence wins.
#[derive(Debug, Clone, Copy)]
pub struct ThreadOptions<'a> {
    s: &'a str
}

impl<'a> ThreadOptions<'a> {
    pub const fn new(s: &'a str) -> Self {
        ThreadOptions { s }
    }

    pub fn iter(&self) -> OptionsIter<'a> {
        OptionsIter { s: self.s }
    }

    pub fn try_get<T: OptionParseable<'a>>(&self, key: &str) -> Option<Option<Result<T, InvalidOptionValue>>> {
        self.iter()
            .filter(|&(k, _)| k == key)
            .last()
            .map(|(_, val)| val.map(|val| T::try_parse_opt(val)))
    }

    pub fn warn_invalid(key: &str) {
        log!(Warning, "options", "Invalid value given for option '{}'", key);
    }

    pub fn get<T: OptionParseable<'a>>(&self, key: &str) -> Option<T> {
        match self.try_get(key) {
            Some(Some(Ok(val))) => Some(val),
            Some(_) => {
                Self::warn_invalid(key);
                None
            },
            None => None,
        }
    }

    pub fn get_flag(&self, key: &str) -> Option<bool> {
        match self.try_get(key) {
            Some(Some(Ok(val))) => Some(val),
            Some(None) => Some(true),
            Some(Some(Err(_))) => {
                Self::warn_invalid(key);
                None
            },
            None => None,
        }
    }
}

pub struct OptionsIter<'a> {
    s: &'a str
}

impl<'a> Iterator for OptionsIter<'a> {
    type Item = (&'a str, Option<&'a str>);

    fn next(&mut self) -> Option<Self::Item> {
        let mut s = self.s.trim_start();

        if s.is_empty() {
            self.s = s;
            return None;
        }

        let key_end = s.find(|c: char| c.is_whitespace() || c == '=').unwrap_or(s.len());
        let key = &s[..key_end];

        let val = if s[key_end..].starts_with('=') {
            s = &s[key_end + 1..];

            let val = match s.chars().next() {
                Some(quote @ ('"' | '\'')) => {
                    s = &s[1..];

                    let val_end = s.find(quote).unwrap_or(s.len());
                    let val = &s[..val_end];

                    s = s.get(val_end + 1..).unwrap_or("");
                    val
                },
                _ => {
                    let val_end = s.find(|c: char| c.is_whitespace()).unwrap_or(s.len());
                    let val = &s[..val_end];

                    s = &s[val_end..];
                    val
                },
            };

            Some(val)
        } else {
            s = &s[key_end..];
            None
        };

        self.s = s;
        Some((key, val))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidOptionValue;

pub trait OptionParseable<'a>
where
    Self: Sized,
{
    fn try_parse_opt(s: &'a str) -> Result<Self, InvalidOptionValue>;
}

impl<'a> OptionParseable<'a> for &'a str {
    fn try_parse_opt(s: &'a str) -> Result<Self, InvalidOptionValue> {
        Ok(s)
    }
}

impl<'a> OptionParseable<'a> for u32 {
    fn try_parse_opt(s: &'a str) -> Result<Self, InvalidOptionValue> {
        s.parse().map_err(|_| InvalidOptionValue)
    }
}

impl<'a> OptionParseable<'a> for bool {
    fn try_parse_opt(s: &'a str) -> Result<Self, InvalidOptionValue> {
        match s {
            "0" => Ok(false),
            "false" => Ok(false),
            "1" => Ok(true),
            "true" => Ok(true),
            "no" => Ok(false),
            "yes" => Ok(true),
            _ => Err(InvalidOptionValue),
        }
    }
}

impl<'a> OptionParseable<'a> for LogLevel {
    fn try_parse_opt(s: &'a str) -> Result<Self, InvalidOptionValue> {
        LogLevel::from_name(s).ok_or(InvalidOptionValue)
    }
}

/// Applies the options that configure the logger.
pub fn apply_log_options(options: &ThreadOptions) {
    if let Some(level) = options.get::<LogLevel>("log.level") {
        log::set_max_level(level);
    }

    if let Some(color) = options.get_flag("log.color") {
        log::set_color(color);
    }
}

/// Applies the options string the dispatcher was built with. This is a boot step of its own, to be run before the first log message that
/// should honour `log.level` or `log.color`.
pub fn init() {
    apply_log_options(&ThreadOptions::new(OPTIONS_STR));
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_keys_and_values() {
        let opts = ThreadOptions::new("  log.level=debug quiet log.color='no' name=\"a b\"  ");
        let mut iter = opts.iter();

        assert_eq!(Some(("log.level", Some("debug"))), iter.next());
        assert_eq!(Some(("quiet", None)), iter.next());
        assert_eq!(Some(("log.color", Some("no"))), iter.next());
        assert_eq!(Some(("name", Some("a b"))), iter.next());
        assert_eq!(None, iter.next());
    }

    #[test]
    fn test_unterminated_quote() {
        let opts = ThreadOptions::new("name=\"abc");

        assert_eq!(Some("abc"), opts.get::<&str>("name"));
    }

    #[test]
    fn test_last_occurrence_wins() {
        let opts = ThreadOptions::new("n=1 n=2");

        assert_eq!(Some(2u32), opts.get("n"));
    }

    #[test]
    fn test_typed_lookup() {
        let opts = ThreadOptions::new("log.level=warning flag n=abc");

        assert_eq!(Some(LogLevel::Warning), opts.get("log.level"));
        assert_eq!(Some(true), opts.get_flag("flag"));
        assert_eq!(None, opts.get::<u32>("n"));
        assert_eq!(Some(Some(Err(InvalidOptionValue))), opts.try_get::<u32>("n"));
        assert_eq!(None, opts.get::<u32>("missing"));
    }

    #[test]
    fn test_empty() {
        assert_eq!(None, ThreadOptions::new("   ").iter().next());
    }
}
