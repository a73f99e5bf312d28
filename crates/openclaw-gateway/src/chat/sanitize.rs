//! `chat.send` input sanitization: NFC-normalize and strip NUL/C0 control
//! characters other than tab/CR/LF, per the web-chat RPC contract.

use unicode_normalization::UnicodeNormalization;

pub fn sanitize_message(input: &str) -> String {
    let nfc: String = input.nfc().collect();
    nfc.chars()
        .filter(|&c| c != '\0' && (c >= '\u{20}' || c == '\t' || c == '\r' || c == '\n'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_nul_and_control_chars_but_keeps_whitespace() {
        let raw = "hi\0there\x07\tfriend\r\n";
        assert_eq!(sanitize_message(raw), "hithere\tfriend\r\n");
    }

    #[test]
    fn nfc_normalizes_combining_forms() {
        let decomposed = "e\u{0301}cole"; // e + combining acute
        let normalized = sanitize_message(decomposed);
        assert_eq!(normalized, "\u{00e9}cole");
    }
}
