//! Small utility helpers used across modules.

/// Very small and safe string templating.
/// Replaces occurrences of `{key}` in the template with provided values.
pub fn fill_template(tpl: &str, pairs: &[(&str, &str)]) -> String {
  let mut out = tpl.to_string();
  for (k, v) in pairs {
    let needle = format!("{{{}}}", k);
    out = out.replace(&needle, v);
  }
  out
}

/// Log-safe preview: first `max` chars followed by the total length.
pub fn trunc_for_log(s: &str, max: usize) -> String {
  let count = s.chars().count();
  if count <= max {
    s.to_string()
  } else {
    format!("{}… ({} chars total)", s.chars().take(max).collect::<String>(), count)
  }
}

/// True if the char is in one of the common emoji blocks.
/// Used to validate single-glyph icons returned by the model.
pub fn is_emoji(ch: char) -> bool {
  matches!(ch,
    '\u{1F000}'..='\u{1F2FF}'   // mahjong, cards, enclosed alphanumerics/ideographs, flags
    | '\u{1F300}'..='\u{1F5FF}' // symbols & pictographs
    | '\u{1F600}'..='\u{1F64F}' // emoticons
    | '\u{1F680}'..='\u{1F6FF}' // transport & map
    | '\u{1F780}'..='\u{1F7FF}' // geometric shapes ext (🟠, 🟩)
    | '\u{1F900}'..='\u{1F9FF}' // supplemental symbols
    | '\u{1FA70}'..='\u{1FAFF}' // symbols & pictographs ext-A
    | '\u{2600}'..='\u{26FF}'   // misc symbols
    | '\u{2700}'..='\u{27BF}'   // dingbats
    | '\u{00A9}' | '\u{00AE}' | '\u{203C}' | '\u{2049}' | '\u{2122}' | '\u{2139}'
    | '\u{2B50}' | '\u{2B55}' | '\u{2B1B}' | '\u{2B1C}'
    | '\u{231A}' | '\u{231B}' | '\u{23F0}'..='\u{23F3}'
  )
}

/// Escape text for a single markdown table cell.
pub fn md_cell(s: &str) -> String {
  s.trim().replace('|', "\\|").replace("\r\n", "<br>").replace('\n', "<br>")
}
