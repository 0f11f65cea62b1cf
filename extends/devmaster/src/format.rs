//! `%`-directive format expander (spec module B).
//!
//! Walks a template left to right, expanding directives against whatever the
//! caller's [`ExpandContext`] exposes. Expansion is single-pass: a directive
//! like `%e` sees the buffer as it stands *so far*, not the final result.
use std::fmt::Write as _;

/// everything the expander needs to know about the device/program/records
/// being formatted. Implemented by the resolver's evaluation context.
pub trait ExpandContext {
    /// `%b`
    fn bus_id(&self) -> &str;
    /// `%k`
    fn kernel(&self) -> &str;
    /// `%n`
    fn kernel_number(&self) -> Option<&str>;
    /// `%m`
    fn minor(&self) -> Option<u64>;
    /// `%M`
    fn major(&self) -> Option<u64>;
    /// `%c`/`%c{N}`/`%c{N+}`: the captured stdout of the rule's `program` action
    fn program_result(&self) -> Option<&str>;
    /// `%s{attr}`
    fn sysattr(&self, name: &str) -> Option<String>;
    /// `%e`: true if `candidate` already names an existing persisted record
    fn name_taken(&self, candidate: &str) -> bool;
}

/// expand `template` against `ctx`, truncating the final result to at most
/// `cap` bytes (`usize::MAX` for "no cap").
pub fn expand(template: &str, ctx: &dyn ExpandContext, cap: usize) -> String {
    let mut out = String::new();
    let chars: Vec<char> = template.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        if chars[i] != '%' {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        i += 1;
        if i >= chars.len() {
            out.push('%');
            break;
        }

        // optional decimal length cap between '%' and the directive char
        let mut digits = String::new();
        while i < chars.len() && chars[i].is_ascii_digit() {
            digits.push(chars[i]);
            i += 1;
        }
        let field_cap = digits.parse::<usize>().ok();

        if i >= chars.len() {
            out.push('%');
            out.push_str(&digits);
            break;
        }

        let directive = chars[i];
        i += 1;

        let expanded = match directive {
            '%' => "%".to_string(),
            'b' => ctx.bus_id().to_string(),
            'k' => ctx.kernel().to_string(),
            'n' => ctx.kernel_number().unwrap_or("").to_string(),
            'm' => ctx.minor().map(|v| v.to_string()).unwrap_or_default(),
            'M' => ctx.major().map(|v| v.to_string()).unwrap_or_default(),
            'c' => {
                let (arg, consumed) = read_brace_arg(&chars, i);
                i += consumed;
                expand_program_result(ctx.program_result(), arg.as_deref())
            }
            's' => {
                let (arg, consumed) = read_brace_arg(&chars, i);
                i += consumed;
                match arg {
                    Some(attr) => ctx.sysattr(&attr).unwrap_or_default(),
                    None => {
                        log::warn!("format: %s directive missing {{attr}}");
                        String::new()
                    }
                }
            }
            'e' => expand_free_number(&out, ctx),
            other => {
                log::warn!("format: unknown directive %{other}, ignoring");
                String::new()
            }
        };

        let expanded = match field_cap {
            Some(n) => expanded.chars().take(n).collect(),
            None => expanded,
        };
        out.push_str(&expanded);
    }

    if out.len() > cap {
        // truncate on a char boundary
        let mut end = cap;
        while end > 0 && !out.is_char_boundary(end) {
            end -= 1;
        }
        out.truncate(end);
    }

    out
}

/// read an optional `{...}` argument right after a directive char; returns
/// the argument (without braces) and the number of chars consumed.
fn read_brace_arg(chars: &[char], start: usize) -> (Option<String>, usize) {
    if chars.get(start) != Some(&'{') {
        return (None, 0);
    }
    let mut j = start + 1;
    let mut arg = String::new();
    while j < chars.len() && chars[j] != '}' {
        arg.push(chars[j]);
        j += 1;
    }
    if j < chars.len() {
        // consumed '{' + arg + '}'
        (Some(arg), j - start + 1)
    } else {
        // unterminated: consume nothing, treat as no argument
        (None, 0)
    }
}

fn expand_program_result(result: Option<&str>, arg: Option<&str>) -> String {
    let result = match result {
        Some(r) => r,
        None => return String::new(),
    };

    let fields: Vec<&str> = result.split_whitespace().collect();

    let arg = match arg {
        Some(a) => a,
        None => return result.to_string(),
    };

    let (n_str, from_n_to_end) = if let Some(stripped) = arg.strip_suffix('+') {
        (stripped, true)
    } else {
        (arg, false)
    };

    let n: usize = match n_str.parse() {
        Ok(n) if n >= 1 => n,
        _ => return String::new(),
    };

    if from_n_to_end {
        if n > fields.len() {
            String::new()
        } else {
            fields[n - 1..].join(" ")
        }
    } else {
        fields.get(n - 1).map(|s| s.to_string()).unwrap_or_default()
    }
}

fn expand_free_number(prefix_so_far: &str, ctx: &dyn ExpandContext) -> String {
    if !ctx.name_taken(prefix_so_far) {
        return String::new();
    }
    let mut n: u64 = 1;
    loop {
        let mut candidate = String::new();
        let _ = write!(candidate, "{prefix_so_far}{n}");
        if !ctx.name_taken(&candidate) {
            return n.to_string();
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashSet;

    struct Ctx {
        bus_id: String,
        kernel: String,
        kernel_number: Option<String>,
        minor: Option<u64>,
        major: Option<u64>,
        program_result: Option<String>,
        sysattrs: std::collections::HashMap<String, String>,
        taken: RefCell<HashSet<String>>,
    }

    impl Default for Ctx {
        fn default() -> Self {
            Ctx {
                bus_id: String::new(),
                kernel: String::new(),
                kernel_number: None,
                minor: None,
                major: None,
                program_result: None,
                sysattrs: Default::default(),
                taken: RefCell::new(HashSet::new()),
            }
        }
    }

    impl ExpandContext for Ctx {
        fn bus_id(&self) -> &str {
            &self.bus_id
        }
        fn kernel(&self) -> &str {
            &self.kernel
        }
        fn kernel_number(&self) -> Option<&str> {
            self.kernel_number.as_deref()
        }
        fn minor(&self) -> Option<u64> {
            self.minor
        }
        fn major(&self) -> Option<u64> {
            self.major
        }
        fn program_result(&self) -> Option<&str> {
            self.program_result.as_deref()
        }
        fn sysattr(&self, name: &str) -> Option<String> {
            self.sysattrs.get(name).cloned()
        }
        fn name_taken(&self, candidate: &str) -> bool {
            self.taken.borrow().contains(candidate)
        }
    }

    #[test]
    fn no_percent_is_unchanged() {
        let ctx = Ctx::default();
        assert_eq!(expand("plain-string", &ctx, usize::MAX), "plain-string");
    }

    #[test]
    fn literal_percent() {
        let ctx = Ctx::default();
        assert_eq!(expand("%%", &ctx, usize::MAX), "%");
    }

    #[test]
    fn basic_directives() {
        let ctx = Ctx {
            kernel: "sda1".to_string(),
            kernel_number: Some("1".to_string()),
            major: Some(8),
            minor: Some(1),
            bus_id: "2:0:0:0".to_string(),
            ..Default::default()
        };
        assert_eq!(expand("%b:%k:%n:%M:%m", &ctx, usize::MAX), "2:0:0:0:sda1:1:8:1");
    }

    #[test]
    fn program_result_fields() {
        let ctx = Ctx {
            program_result: Some("ID_MODEL=Foo ID_SERIAL=123".to_string()),
            ..Default::default()
        };
        assert_eq!(expand("%c", &ctx, usize::MAX), "ID_MODEL=Foo ID_SERIAL=123");
        assert_eq!(expand("%c{1}", &ctx, usize::MAX), "ID_MODEL=Foo");
        assert_eq!(expand("%c{2+}", &ctx, usize::MAX), "ID_SERIAL=123");
        assert_eq!(expand("%c{3}", &ctx, usize::MAX), "");
    }

    #[test]
    fn sysattr_lookup() {
        let mut ctx = Ctx::default();
        ctx.sysattrs.insert("vendor".to_string(), "ATA".to_string());
        assert_eq!(expand("%s{vendor}", &ctx, usize::MAX), "ATA");
        assert_eq!(expand("%s{missing}", &ctx, usize::MAX), "");
    }

    #[test]
    fn free_number_zero_when_original_free() {
        let ctx = Ctx::default();
        assert_eq!(expand("cam%e", &ctx, usize::MAX), "cam");
    }

    #[test]
    fn free_number_skips_taken_names() {
        let ctx = Ctx::default();
        ctx.taken.borrow_mut().insert("cam".to_string());
        ctx.taken.borrow_mut().insert("cam1".to_string());
        assert_eq!(expand("cam%e", &ctx, usize::MAX), "cam2");
    }

    #[test]
    fn field_length_cap() {
        let ctx = Ctx {
            kernel: "sdabcdef".to_string(),
            ..Default::default()
        };
        assert_eq!(expand("%3k", &ctx, usize::MAX), "sda");
    }

    #[test]
    fn overall_cap_truncates_result() {
        let ctx = Ctx {
            kernel: "sdabcdef".to_string(),
            ..Default::default()
        };
        assert_eq!(expand("prefix-%k", &ctx, 9), "prefix-sd");
    }

    #[test]
    fn unknown_directive_ignored() {
        let ctx = Ctx::default();
        assert_eq!(expand("x%zy", &ctx, usize::MAX), "xy");
    }
}
