//! Hostlist strings: "n[1-3,8],m0" <-> individual node names.
//! Expansion preserves order, which the arbitrary task distribution
//! depends on.

/// Expand a ranged hostlist into individual names.
pub fn expand(list: &str) -> Result<Vec<String>, String> {
    let mut names = Vec::new();
    for part in split_top_level(list)? {
        if let Some(open) = part.find('[') {
            let close = part
                .rfind(']')
                .ok_or_else(|| format!("unbalanced bracket in {}", part))?;
            if close < open {
                return Err(format!("unbalanced bracket in {}", part));
            }
            let prefix = &part[..open];
            let suffix = &part[close + 1..];
            if !suffix.is_empty() {
                return Err(format!("trailing text after bracket in {}", part));
            }
            for range in part[open + 1..close].split(',') {
                let (first, last) = match range.split_once('-') {
                    Some((a, b)) => (a, b),
                    None => (range, range),
                };
                let width = if first.starts_with('0') && first.len() > 1 {
                    first.len()
                } else {
                    0
                };
                let first: u64 = first
                    .parse()
                    .map_err(|_| format!("bad host range: {}", range))?;
                let last: u64 = last
                    .parse()
                    .map_err(|_| format!("bad host range: {}", range))?;
                if last < first {
                    return Err(format!("bad host range: {}", range));
                }
                for i in first..=last {
                    names.push(format!("{}{:0width$}", prefix, i, width = width));
                }
            }
        } else if !part.is_empty() {
            names.push(part.to_string());
        }
    }
    Ok(names)
}

/// Compress names back into ranged form. Adjacent names sharing a
/// prefix and consecutive numeric suffixes are folded into one range.
pub fn compress<'a, I>(names: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    // (prefix, width, first, last) of the currently open run
    let mut out = String::new();
    let mut groups: Vec<(String, Vec<(u64, u64, usize)>)> = Vec::new();

    for name in names {
        let (prefix, number, width) = split_numeric_suffix(name);
        match (groups.last_mut(), number) {
            (Some((last_prefix, ranges)), Some(num))
                if *last_prefix == prefix && !ranges.is_empty() =>
            {
                let (_, last, w) = ranges.last_mut().unwrap();
                if num == *last + 1 && width == *w {
                    *last = num;
                } else {
                    ranges.push((num, num, width));
                }
            }
            (_, Some(num)) => groups.push((prefix.to_string(), vec![(num, num, width)])),
            (_, None) => groups.push((name.to_string(), Vec::new())),
        }
    }

    for (i, (prefix, ranges)) in groups.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        if ranges.is_empty() {
            out.push_str(prefix);
        } else if ranges.len() == 1 && ranges[0].0 == ranges[0].1 {
            let (num, _, width) = ranges[0];
            out.push_str(&format!("{}{:0width$}", prefix, num, width = width));
        } else {
            out.push_str(prefix);
            out.push('[');
            for (j, &(first, last, width)) in ranges.iter().enumerate() {
                if j > 0 {
                    out.push(',');
                }
                if first == last {
                    out.push_str(&format!("{:0width$}", first, width = width));
                } else {
                    out.push_str(&format!(
                        "{:0width$}-{:0width$}",
                        first,
                        last,
                        width = width
                    ));
                }
            }
            out.push(']');
        }
    }
    out
}

fn split_numeric_suffix(name: &str) -> (&str, Option<u64>, usize) {
    let digits = name.chars().rev().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return (name, None, 0);
    }
    let (prefix, suffix) = name.split_at(name.len() - digits);
    let width = if suffix.starts_with('0') && suffix.len() > 1 {
        suffix.len()
    } else {
        0
    };
    match suffix.parse() {
        Ok(num) => (prefix, Some(num), width),
        Err(_) => (name, None, 0),
    }
}

fn split_top_level(list: &str) -> Result<Vec<&str>, String> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in list.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.checked_sub(1).ok_or("unbalanced bracket")?,
            ',' if depth == 0 => {
                parts.push(&list[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err("unbalanced bracket".to_string());
    }
    parts.push(&list[start..]);
    Ok(parts)
}
