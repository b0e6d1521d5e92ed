//! Stateless calendar widget: month/time grid renderer and callback codec.
//!
//! Callback data format: `cal:<bot>:<user>:<action>:<payload>`. The renderer
//! holds no state; the owning wizard records which variable receives the
//! picked value.

use chrono::{Datelike, FixedOffset, NaiveDate, Utc};
use uuid::Uuid;

use super::{Keyboard, KeyboardButton};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CalMode {
    /// Date pick is terminal.
    Date,
    /// Date pick reveals the time grid; time pick is terminal.
    DateTime,
}

/// Widget parameters from the spec.
#[derive(Clone, Debug)]
pub struct CalendarSpec {
    pub mode: CalMode,
    pub min: Option<NaiveDate>,
    pub max: Option<NaiveDate>,
    /// Fixed offset like `+03:00`; drives which month opens first.
    pub tz: Option<String>,
    pub title: Option<String>,
}

/// Decoded callback action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CalAction {
    Nav { year: i32, month: u32 },
    Pick { date: NaiveDate },
    Time { date: NaiveDate, hour: u32, minute: u32 },
    Back { year: i32, month: u32 },
    Noop,
}

impl CalAction {
    /// The value stored into the wizard variable on a terminal pick.
    pub fn picked_value(&self) -> Option<String> {
        match self {
            CalAction::Pick { date } => Some(date.format("%Y-%m-%d").to_string()),
            CalAction::Time { date, hour, minute } => {
                Some(format!("{} {:02}:{:02}", date.format("%Y-%m-%d"), hour, minute))
            }
            _ => None,
        }
    }
}

/// Fully decoded callback: owner identifiers plus the action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CalCallback {
    pub bot_id: Uuid,
    pub user_id: i64,
    pub action: CalAction,
}

pub fn encode(bot_id: Uuid, user_id: i64, action: &CalAction) -> String {
    let (tag, payload) = match action {
        CalAction::Nav { year, month } => ("nav", format!("{year:04}-{month:02}")),
        CalAction::Pick { date } => ("pick", date.format("%Y-%m-%d").to_string()),
        CalAction::Time { date, hour, minute } => (
            "time",
            format!("{}T{hour:02}:{minute:02}", date.format("%Y-%m-%d")),
        ),
        CalAction::Back { year, month } => ("back", format!("{year:04}-{month:02}")),
        CalAction::Noop => ("noop", "-".to_string()),
    };
    format!("cal:{bot_id}:{user_id}:{tag}:{payload}")
}

/// Decode `cal:<bot>:<user>:<action>:<payload>`. Returns `None` on anything
/// malformed; `Noop` decodes but is dropped by the caller.
pub fn decode(data: &str) -> Option<CalCallback> {
    let rest = data.strip_prefix("cal:")?;
    let mut parts = rest.splitn(3, ':');
    let bot_id: Uuid = parts.next()?.parse().ok()?;
    let user_id: i64 = parts.next()?.parse().ok()?;
    let tail = parts.next()?;
    let (tag, payload) = tail.split_once(':')?;
    let action = match tag {
        "nav" | "back" => {
            let (y, m) = payload.split_once('-')?;
            let year: i32 = y.parse().ok()?;
            let month: u32 = m.parse().ok()?;
            if !(1..=12).contains(&month) {
                return None;
            }
            if tag == "nav" {
                CalAction::Nav { year, month }
            } else {
                CalAction::Back { year, month }
            }
        }
        "pick" => CalAction::Pick {
            date: NaiveDate::parse_from_str(payload, "%Y-%m-%d").ok()?,
        },
        "time" => {
            let (d, t) = payload.split_once('T')?;
            let date = NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()?;
            let (h, m) = t.split_once(':')?;
            let hour: u32 = h.parse().ok()?;
            let minute: u32 = m.parse().ok()?;
            if hour > 23 || minute > 59 {
                return None;
            }
            CalAction::Time { date, hour, minute }
        }
        "noop" => CalAction::Noop,
        _ => return None,
    };
    Some(CalCallback {
        bot_id,
        user_id,
        action,
    })
}

/// The month the widget opens on: today in the spec's timezone, clamped into
/// `[min, max]`.
pub fn initial_month(spec: &CalendarSpec) -> (i32, u32) {
    let today = today_in_tz(spec.tz.as_deref());
    let clamped = match (spec.min, spec.max) {
        (Some(min), _) if today < min => min,
        (_, Some(max)) if today > max => max,
        _ => today,
    };
    (clamped.year(), clamped.month())
}

fn today_in_tz(tz: Option<&str>) -> NaiveDate {
    let offset = tz
        .and_then(|s| s.parse::<FixedOffset>().ok())
        .unwrap_or_else(|| FixedOffset::east_opt(0).unwrap());
    Utc::now().with_timezone(&offset).date_naive()
}

const WEEKDAYS: [&str; 7] = ["Mo", "Tu", "We", "Th", "Fr", "Sa", "Su"];

const MONTHS: [&str; 12] = [
    "January", "February", "March", "April", "May", "June", "July", "August", "September",
    "October", "November", "December",
];

/// Render the month grid. Cells outside `[min, max]` keep their label but get
/// a `noop` callback.
pub fn render_month(
    bot_id: Uuid,
    user_id: i64,
    spec: &CalendarSpec,
    year: i32,
    month: u32,
) -> Keyboard {
    let mut rows = Vec::new();
    let noop = encode(bot_id, user_id, &CalAction::Noop);

    if let Some(title) = &spec.title {
        rows.push(vec![KeyboardButton {
            text: title.clone(),
            callback_data: noop.clone(),
        }]);
    }

    let (py, pm) = prev_month(year, month);
    let (ny, nm) = next_month(year, month);
    let prev_allowed = spec
        .min
        .map(|min| (py, pm) >= (min.year(), min.month()))
        .unwrap_or(true);
    let next_allowed = spec
        .max
        .map(|max| (ny, nm) <= (max.year(), max.month()))
        .unwrap_or(true);
    rows.push(vec![
        KeyboardButton {
            text: "«".to_string(),
            callback_data: if prev_allowed {
                encode(bot_id, user_id, &CalAction::Nav { year: py, month: pm })
            } else {
                noop.clone()
            },
        },
        KeyboardButton {
            text: format!("{} {}", MONTHS[(month - 1) as usize], year),
            callback_data: noop.clone(),
        },
        KeyboardButton {
            text: "»".to_string(),
            callback_data: if next_allowed {
                encode(bot_id, user_id, &CalAction::Nav { year: ny, month: nm })
            } else {
                noop.clone()
            },
        },
    ]);

    rows.push(
        WEEKDAYS
            .iter()
            .map(|d| KeyboardButton {
                text: d.to_string(),
                callback_data: noop.clone(),
            })
            .collect(),
    );

    let first = NaiveDate::from_ymd_opt(year, month, 1).expect("valid month");
    let lead = first.weekday().num_days_from_monday() as usize;
    let days = days_in_month(year, month);

    let mut week: Vec<KeyboardButton> = Vec::with_capacity(7);
    for _ in 0..lead {
        week.push(KeyboardButton {
            text: "·".to_string(),
            callback_data: noop.clone(),
        });
    }
    for day in 1..=days {
        let date = NaiveDate::from_ymd_opt(year, month, day).expect("valid day");
        let in_range = spec.min.map(|m| date >= m).unwrap_or(true)
            && spec.max.map(|m| date <= m).unwrap_or(true);
        week.push(KeyboardButton {
            text: day.to_string(),
            callback_data: if in_range {
                encode(bot_id, user_id, &CalAction::Pick { date })
            } else {
                noop.clone()
            },
        });
        if week.len() == 7 {
            rows.push(std::mem::take(&mut week));
        }
    }
    if !week.is_empty() {
        while week.len() < 7 {
            week.push(KeyboardButton {
                text: "·".to_string(),
                callback_data: noop.clone(),
            });
        }
        rows.push(week);
    }

    Keyboard { rows }
}

/// 30-minute slots from 09:00 to 20:30, four per row, plus a back row.
pub fn render_time_grid(bot_id: Uuid, user_id: i64, date: NaiveDate) -> Keyboard {
    let noop = encode(bot_id, user_id, &CalAction::Noop);
    let mut rows = vec![vec![KeyboardButton {
        text: date.format("%Y-%m-%d").to_string(),
        callback_data: noop,
    }]];

    let mut row: Vec<KeyboardButton> = Vec::with_capacity(4);
    for half in 18..42 {
        let hour = half / 2;
        let minute = (half % 2) * 30;
        row.push(KeyboardButton {
            text: format!("{hour:02}:{minute:02}"),
            callback_data: encode(bot_id, user_id, &CalAction::Time { date, hour, minute }),
        });
        if row.len() == 4 {
            rows.push(std::mem::take(&mut row));
        }
    }

    rows.push(vec![KeyboardButton {
        text: "← back".to_string(),
        callback_data: encode(
            bot_id,
            user_id,
            &CalAction::Back {
                year: date.year(),
                month: date.month(),
            },
        ),
    }]);

    Keyboard { rows }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (ny, nm) = next_month(year, month);
    NaiveDate::from_ymd_opt(ny, nm, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(30)
}

fn prev_month(year: i32, month: u32) -> (i32, u32) {
    if month == 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    }
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}
