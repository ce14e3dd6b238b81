//! Template engine for remote file paths.
//!
//! Supports exactly the symbols `{event.start}`, `{event.end}`, `{event.id}`,
//! `{camera_name}`, `{detection_type}` and `{duration_seconds}`. Timestamp
//! symbols accept a trailing `:FORMAT` strftime specifier and render in the
//! NVR's local timezone. Unknown symbols and invalid strftime directives are
//! rejected at startup.

use crate::error::Error;
use anyhow::Result;
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, FixedOffset};

const DEFAULT_TS_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    EventStart(String),
    EventEnd(String),
    EventId,
    CameraName,
    DetectionType,
    DurationSeconds,
}

/// A parsed path template.
#[derive(Debug, Clone)]
pub struct PathTemplate {
    segments: Vec<Segment>,
}

/// Values substituted into a [`PathTemplate`].
#[derive(Debug, Clone)]
pub struct TemplateContext<'a> {
    pub event_id: &'a str,
    pub camera_name: &'a str,
    pub detection_type: &'a str,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    pub duration_seconds: i64,
}

impl PathTemplate {
    pub fn parse(input: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = input.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' => {
                    if chars.peek() == Some(&'{') {
                        chars.next();
                        literal.push('{');
                        continue;
                    }

                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }

                    let mut field = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        field.push(c);
                    }
                    if !closed {
                        return Err(Error::Template(format!(
                            "unterminated `{{` in template `{input}`"
                        ))
                        .into());
                    }

                    segments.push(parse_field(&field, input)?);
                }
                '}' => {
                    if chars.peek() == Some(&'}') {
                        chars.next();
                        literal.push('}');
                    } else {
                        return Err(Error::Template(format!(
                            "stray `}}` in template `{input}`"
                        ))
                        .into());
                    }
                }
                c => literal.push(c),
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(PathTemplate { segments })
    }

    /// Render the template. The result is sanitized so it is always a safe
    /// relative remote path.
    pub fn render(&self, ctx: &TemplateContext<'_>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::EventStart(fmt) => out.push_str(&ctx.start.format(fmt).to_string()),
                Segment::EventEnd(fmt) => out.push_str(&ctx.end.format(fmt).to_string()),
                Segment::EventId => out.push_str(ctx.event_id),
                Segment::CameraName => out.push_str(ctx.camera_name),
                Segment::DetectionType => out.push_str(ctx.detection_type),
                Segment::DurationSeconds => out.push_str(&ctx.duration_seconds.to_string()),
            }
        }
        sanitize(&out)
    }
}

fn parse_field(field: &str, template: &str) -> Result<Segment> {
    let (name, format) = match field.split_once(':') {
        Some((name, format)) => (name, Some(format)),
        None => (field, None),
    };

    let segment = match name {
        "event.start" => Segment::EventStart(validated_ts_format(format, template)?),
        "event.end" => Segment::EventEnd(validated_ts_format(format, template)?),
        "event.id" => Segment::EventId,
        "camera_name" => Segment::CameraName,
        "detection_type" => Segment::DetectionType,
        "duration_seconds" => Segment::DurationSeconds,
        other => {
            return Err(Error::Template(format!(
                "unknown template symbol `{{{other}}}` in `{template}`"
            ))
            .into())
        }
    };

    if format.is_some() && !matches!(segment, Segment::EventStart(_) | Segment::EventEnd(_)) {
        return Err(Error::Template(format!(
            "symbol `{{{name}}}` does not accept a format specifier"
        ))
        .into());
    }

    Ok(segment)
}

fn validated_ts_format(format: Option<&str>, template: &str) -> Result<String> {
    let format = format.unwrap_or(DEFAULT_TS_FORMAT);
    for item in StrftimeItems::new(format) {
        if matches!(item, Item::Error) {
            return Err(Error::Template(format!(
                "invalid date format `{format}` in template `{template}`"
            ))
            .into());
        }
    }
    Ok(format.to_string())
}

/// Strip characters that are unsafe in remote paths, collapsing anything
/// outside `[A-Za-z0-9_\-.() /]`.
fn sanitize(path: &str) -> String {
    path.chars()
        .filter(|c| c.is_ascii_alphanumeric() || " _-.()/".contains(*c))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx(offset_secs: i32) -> TemplateContext<'static> {
        let tz = FixedOffset::east_opt(offset_secs).unwrap();
        TemplateContext {
            event_id: "evt123",
            camera_name: "Front Door",
            detection_type: "motion",
            start: tz.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap(),
            end: tz.with_ymd_and_hms(2024, 1, 1, 10, 0, 5).unwrap(),
            duration_seconds: 5,
        }
    }

    #[test]
    fn renders_default_template() {
        let template = PathTemplate::parse(
            "{camera_name}/{event.start:%Y-%m-%d}/{event.end:%Y-%m-%dT%H-%M-%S} {detection_type}.mp4",
        )
        .unwrap();
        assert_eq!(
            template.render(&ctx(0)),
            "Front Door/2024-01-01/2024-01-01T10-00-05 motion.mp4"
        );
    }

    #[test]
    fn renders_in_local_offset() {
        let template = PathTemplate::parse("{event.start:%H-%M}").unwrap();
        // 10:00 at +01:00
        assert_eq!(template.render(&ctx(3600)), "10-00");
    }

    #[test]
    fn bare_timestamps_use_default_format() {
        let template = PathTemplate::parse("{event.end}").unwrap();
        assert_eq!(template.render(&ctx(0)), "2024-01-01T10-00-05");
    }

    #[test]
    fn renders_remaining_symbols() {
        let template = PathTemplate::parse("{event.id}-{duration_seconds}s").unwrap();
        assert_eq!(template.render(&ctx(0)), "evt123-5s");
    }

    #[test]
    fn rejects_unknown_symbol() {
        assert!(PathTemplate::parse("{camera_ip}/clip.mp4").is_err());
    }

    #[test]
    fn rejects_invalid_date_directive() {
        assert!(PathTemplate::parse("{event.start:%Q}").is_err());
    }

    #[test]
    fn rejects_format_on_non_timestamp() {
        assert!(PathTemplate::parse("{camera_name:%Y}").is_err());
    }

    #[test]
    fn rejects_unterminated_field() {
        assert!(PathTemplate::parse("{camera_name/clip.mp4").is_err());
    }

    #[test]
    fn escaped_braces_are_literal() {
        let template = PathTemplate::parse("{{literal}}/{camera_name}").unwrap();
        // Braces themselves are not path safe and get stripped.
        assert_eq!(template.render(&ctx(0)), "literal/Front Door");
    }

    #[test]
    fn sanitizes_unsafe_characters() {
        let template = PathTemplate::parse("{camera_name}.mp4").unwrap();
        let tz = FixedOffset::east_opt(0).unwrap();
        let ctx = TemplateContext {
            event_id: "e",
            camera_name: "Back: Yard*?",
            detection_type: "motion",
            start: tz.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            end: tz.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap(),
            duration_seconds: 1,
        };
        assert_eq!(template.render(&ctx), "Back Yard.mp4");
    }
}
