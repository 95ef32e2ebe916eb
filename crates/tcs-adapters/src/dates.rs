//! Tolerant date-range extraction from scraped calendar text.

use chrono::NaiveDate;

const MONTH_PREFIXES: [(&str, u32); 25] = [
    ("jan", 1),
    ("feb", 2),
    ("mar", 3),
    ("apr", 4),
    ("may", 5),
    ("jun", 6),
    ("jul", 7),
    ("aug", 8),
    ("sep", 9),
    ("oct", 10),
    ("nov", 11),
    ("dec", 12),
    ("янв", 1),
    ("фев", 2),
    ("мар", 3),
    ("апр", 4),
    ("мая", 5),
    ("май", 5),
    ("июн", 6),
    ("июл", 7),
    ("авг", 8),
    ("сен", 9),
    ("окт", 10),
    ("ноя", 11),
    ("дек", 12),
];

/// Start and end date described by free text, or `None` when the text is unusable.
///
/// Numeric forms (`2027-03-12`, `12.03.2027`) take precedence; otherwise the text is
/// read as day numbers, month names (English or Russian) and a year. A single date
/// yields a one-day range.
pub fn parse_date_range(text: &str) -> Option<(NaiveDate, NaiveDate)> {
    let numeric = numeric_dates(text);
    let (start, end) = match (numeric.first(), numeric.last()) {
        (Some(first), Some(last)) => (*first, *last),
        _ => month_name_range(text)?,
    };
    (start <= end).then_some((start, end))
}

pub fn parse_single_date(text: &str) -> Option<NaiveDate> {
    parse_date_range(text).map(|(start, _)| start)
}

fn numeric_dates(text: &str) -> Vec<NaiveDate> {
    let chars = text.chars().collect::<Vec<_>>();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let at_number_start =
            chars[i].is_ascii_digit() && (i == 0 || !chars[i - 1].is_ascii_digit());
        if at_number_start {
            if let Some((date, len)) = match_numeric_date(&chars[i..]) {
                out.push(date);
                i += len;
                continue;
            }
        }
        i += 1;
    }
    out
}

fn take_digits(chars: &[char], max: usize) -> Option<(u32, usize)> {
    let n = chars.iter().take_while(|c| c.is_ascii_digit()).count();
    if n == 0 || n > max {
        return None;
    }
    let value = chars[..n].iter().collect::<String>().parse().ok()?;
    Some((value, n))
}

fn match_numeric_date(chars: &[char]) -> Option<(NaiveDate, usize)> {
    let (first, a) = take_digits(chars, 4)?;
    let sep = *chars.get(a)?;
    if !matches!(sep, '-' | '.' | '/') {
        return None;
    }
    let (second, b) = take_digits(&chars[a + 1..], 2)?;
    if chars.get(a + 1 + b) != Some(&sep) {
        return None;
    }
    let (third, c) = take_digits(&chars[a + 2 + b..], 4)?;

    let date = if a == 4 && c <= 2 {
        NaiveDate::from_ymd_opt(first as i32, second, third)
    } else if a <= 2 && c == 4 {
        NaiveDate::from_ymd_opt(third as i32, second, first)
    } else {
        None
    }?;
    Some((date, a + b + c + 2))
}

#[derive(Debug, PartialEq)]
enum Token {
    Number(String),
    Word(String),
}

fn tokens(text: &str) -> Vec<Token> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut numeric = false;

    let flush = |current: &mut String, numeric: bool, out: &mut Vec<Token>| {
        if current.is_empty() {
            return;
        }
        let value = std::mem::take(current);
        out.push(if numeric {
            Token::Number(value)
        } else {
            Token::Word(value.to_lowercase())
        });
    };

    for ch in text.chars() {
        if ch.is_ascii_digit() {
            if !numeric {
                flush(&mut current, numeric, &mut out);
                numeric = true;
            }
            current.push(ch);
        } else if ch.is_alphabetic() {
            if numeric {
                flush(&mut current, numeric, &mut out);
                numeric = false;
            }
            current.push(ch);
        } else {
            flush(&mut current, numeric, &mut out);
        }
    }
    flush(&mut current, numeric, &mut out);
    out
}

fn month_from_word(word: &str) -> Option<u32> {
    if word.chars().count() < 3 {
        return None;
    }
    MONTH_PREFIXES
        .iter()
        .find(|(prefix, _)| word.starts_with(prefix))
        .map(|(_, month)| *month)
}

fn month_name_range(text: &str) -> Option<(NaiveDate, NaiveDate)> {
    let mut days = Vec::new();
    let mut months = Vec::new();
    let mut years = Vec::new();

    for token in tokens(text) {
        match token {
            Token::Number(digits) if digits.len() == 4 => years.push(digits.parse::<i32>().ok()?),
            Token::Number(digits) if digits.len() <= 2 => {
                let day = digits.parse::<u32>().ok()?;
                if (1..=31).contains(&day) {
                    days.push(day);
                }
            }
            Token::Number(_) => {}
            Token::Word(word) => months.extend(month_from_word(&word)),
        }
    }

    let start_day = *days.first()?;
    let end_day = *days.last()?;
    let start_month = *months.first()?;
    let end_month = *months.last()?;
    let end_year = *years.last()?;
    let mut start_year = *years.first()?;
    if years.len() == 1 && start_month > end_month {
        // "28 December - 5 January 2027" spans the year boundary.
        start_year -= 1;
    }

    let start = NaiveDate::from_ymd_opt(start_year, start_month, start_day)?;
    let end = NaiveDate::from_ymd_opt(end_year, end_month, end_day)?;
    Some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn numeric_formats() {
        assert_eq!(
            parse_date_range("2027-03-12 - 2027-03-20"),
            Some((d(2027, 3, 12), d(2027, 3, 20)))
        );
        assert_eq!(
            parse_date_range("12.03.2027-20.03.2027"),
            Some((d(2027, 3, 12), d(2027, 3, 20)))
        );
        assert_eq!(
            parse_date_range("2027-06-01"),
            Some((d(2027, 6, 1), d(2027, 6, 1)))
        );
    }

    #[test]
    fn english_month_names() {
        assert_eq!(
            parse_date_range("12-20 March 2027"),
            Some((d(2027, 3, 12), d(2027, 3, 20)))
        );
        assert_eq!(
            parse_date_range("March 12-20, 2027"),
            Some((d(2027, 3, 12), d(2027, 3, 20)))
        );
        assert_eq!(
            parse_date_range("30 Apr - 2 May 2027"),
            Some((d(2027, 4, 30), d(2027, 5, 2)))
        );
        assert_eq!(
            parse_date_range("28 December 2026 - 5 January 2027"),
            Some((d(2026, 12, 28), d(2027, 1, 5)))
        );
        assert_eq!(
            parse_date_range("28 Dec - 5 Jan 2027"),
            Some((d(2026, 12, 28), d(2027, 1, 5)))
        );
    }

    #[test]
    fn russian_month_names() {
        assert_eq!(
            parse_date_range("12–20 марта 2027 г."),
            Some((d(2027, 3, 12), d(2027, 3, 20)))
        );
        assert_eq!(
            parse_date_range("1 мая 2027"),
            Some((d(2027, 5, 1), d(2027, 5, 1)))
        );
    }

    #[test]
    fn unusable_text_is_rejected() {
        assert_eq!(parse_date_range(""), None);
        assert_eq!(parse_date_range("April 2027"), None);
        assert_eq!(parse_date_range("TBA"), None);
        assert_eq!(parse_date_range("31 February 2027"), None);
        assert_eq!(parse_date_range("2027-03-20 - 2027-03-12"), None);
    }
}
