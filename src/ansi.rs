//! ANSI escape sequence parsing for HTML rendering.
//!
//! Converts ANSI-colored child output into HTML spans so the log viewer can
//! render colors safely without leaking control characters into the page.

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct AnsiState {
    fg: Option<AnsiColor>,
    bg: Option<AnsiColor>,
    bold: bool,
    dim: bool,
    italic: bool,
    underline: bool,
    crossed_out: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AnsiColor {
    Basic(u8),
    Indexed(u8),
    Rgb(u8, u8, u8),
}

impl AnsiState {
    fn is_plain(&self) -> bool {
        *self == AnsiState::default()
    }

    fn css(&self) -> String {
        let mut rules = Vec::new();
        if let Some(color) = self.fg {
            rules.push(format!("color:{}", color.hex()));
        }
        if let Some(color) = self.bg {
            rules.push(format!("background-color:{}", color.hex()));
        }
        if self.bold {
            rules.push("font-weight:bold".to_string());
        }
        if self.dim {
            rules.push("opacity:0.67".to_string());
        }
        if self.italic {
            rules.push("font-style:italic".to_string());
        }
        match (self.underline, self.crossed_out) {
            (true, true) => rules.push("text-decoration:underline line-through".to_string()),
            (true, false) => rules.push("text-decoration:underline".to_string()),
            (false, true) => rules.push("text-decoration:line-through".to_string()),
            (false, false) => {}
        }
        rules.join(";")
    }
}

impl AnsiColor {
    fn hex(self) -> String {
        let (r, g, b) = match self {
            AnsiColor::Rgb(r, g, b) => (r, g, b),
            AnsiColor::Basic(index) => BASIC_PALETTE[index as usize % 16],
            AnsiColor::Indexed(index) => match index {
                0..=15 => BASIC_PALETTE[index as usize],
                16..=231 => {
                    let v = index - 16;
                    let comp = |c: u8| if c == 0 { 0 } else { 55 + 40 * c };
                    (comp(v / 36), comp((v / 6) % 6), comp(v % 6))
                }
                232..=255 => {
                    let gray = 8 + 10 * (index - 232);
                    (gray, gray, gray)
                }
            },
        };
        format!("#{r:02x}{g:02x}{b:02x}")
    }
}

const BASIC_PALETTE: [(u8, u8, u8); 16] = [
    (0x00, 0x00, 0x00),
    (0xcd, 0x00, 0x00),
    (0x00, 0xcd, 0x00),
    (0xcd, 0xcd, 0x00),
    (0x00, 0x00, 0xee),
    (0xcd, 0x00, 0xcd),
    (0x00, 0xcd, 0xcd),
    (0xe5, 0xe5, 0xe5),
    (0x7f, 0x7f, 0x7f),
    (0xff, 0x00, 0x00),
    (0x00, 0xff, 0x00),
    (0xff, 0xff, 0x00),
    (0x5c, 0x5c, 0xff),
    (0xff, 0x00, 0xff),
    (0x00, 0xff, 0xff),
    (0xff, 0xff, 0xff),
];

/// Renders one line of ANSI-colored text as HTML. Styled runs become
/// `<span style="…">` elements; text content is HTML-escaped.
pub fn render_html(text: &str) -> String {
    let mut spans: Vec<(AnsiState, String)> = Vec::new();
    let mut buffer = String::new();
    let mut state = AnsiState::default();
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '\x1b' {
            if matches!(chars.peek(), Some('[')) {
                chars.next();
                let mut params = String::new();
                let mut final_byte = None;
                while let Some(&c) = chars.peek() {
                    if ('@'..='~').contains(&c) {
                        final_byte = Some(c);
                        chars.next();
                        break;
                    }
                    params.push(c);
                    chars.next();
                }
                if final_byte == Some('m') {
                    flush_span(&mut spans, &mut buffer, &state);
                    apply_sgr(&mut state, &params);
                }
                continue;
            }
            if matches!(chars.peek(), Some(']')) {
                // OSC sequence: skip until BEL or ESC \
                chars.next();
                while let Some(next) = chars.next() {
                    if next == '\x07' {
                        break;
                    }
                    if next == '\x1b' && matches!(chars.peek(), Some('\\')) {
                        chars.next();
                        break;
                    }
                }
                continue;
            }
            // Unknown escape: drop the ESC byte.
            continue;
        }
        if ch == '\r' {
            // Carriage return: overwrite line from start. Keep only last segment.
            flush_span(&mut spans, &mut buffer, &state);
            spans.clear();
            continue;
        }
        buffer.push(ch);
    }
    flush_span(&mut spans, &mut buffer, &state);

    let mut html = String::new();
    for (state, text) in spans {
        let escaped = escape_html(&text);
        if state.is_plain() {
            html.push_str(&escaped);
        } else {
            html.push_str(&format!(
                r#"<span style="{}">{}</span>"#,
                state.css(),
                escaped
            ));
        }
    }
    html
}

fn flush_span(spans: &mut Vec<(AnsiState, String)>, buffer: &mut String, state: &AnsiState) {
    if buffer.is_empty() {
        return;
    }
    spans.push((state.clone(), std::mem::take(buffer)));
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

fn apply_sgr(state: &mut AnsiState, params: &str) {
    let values = parse_params(params);
    let mut i = 0;
    while i < values.len() {
        match values[i] {
            0 => *state = AnsiState::default(),
            1 => state.bold = true,
            2 => state.dim = true,
            3 => state.italic = true,
            4 => state.underline = true,
            9 => state.crossed_out = true,
            22 => {
                state.bold = false;
                state.dim = false;
            }
            23 => state.italic = false,
            24 => state.underline = false,
            29 => state.crossed_out = false,
            30..=37 => state.fg = Some(AnsiColor::Basic((values[i] - 30) as u8)),
            90..=97 => state.fg = Some(AnsiColor::Basic((values[i] - 90 + 8) as u8)),
            40..=47 => state.bg = Some(AnsiColor::Basic((values[i] - 40) as u8)),
            100..=107 => state.bg = Some(AnsiColor::Basic((values[i] - 100 + 8) as u8)),
            39 => state.fg = None,
            49 => state.bg = None,
            38 | 48 => {
                let is_fg = values[i] == 38;
                if let Some((advance, color)) = parse_extended_color(&values[i + 1..]) {
                    if is_fg {
                        state.fg = Some(color);
                    } else {
                        state.bg = Some(color);
                    }
                    i += advance;
                }
            }
            _ => {}
        }
        i += 1;
    }
}

fn parse_params(params: &str) -> Vec<i32> {
    if params.is_empty() {
        return vec![0];
    }
    let mut values = Vec::new();
    for part in params.split(';') {
        if part.is_empty() {
            values.push(0);
        } else if let Ok(value) = part.parse::<i32>() {
            values.push(value);
        }
    }
    if values.is_empty() {
        values.push(0);
    }
    values
}

fn parse_extended_color(values: &[i32]) -> Option<(usize, AnsiColor)> {
    match values.first()? {
        5 => {
            let index = u8::try_from(*values.get(1)?).ok()?;
            Some((2, AnsiColor::Indexed(index)))
        }
        2 => {
            let r = u8::try_from(*values.get(1)?).ok()?;
            let g = u8::try_from(*values.get(2)?).ok()?;
            let b = u8::try_from(*values.get(3)?).ok()?;
            Some((4, AnsiColor::Rgb(r, g, b)))
        }
        _ => None,
    }
}
