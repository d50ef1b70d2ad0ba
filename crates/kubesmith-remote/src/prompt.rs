//! Interactive credential entry.

use std::io::{BufRead, Write};
use std::net::IpAddr;
use std::path::Path;

use crate::credential::Credential;
use crate::error::{RemoteError, RemoteResult};

/// Validation hook applied to each answer.
pub type Validator = fn(&str) -> Result<(), String>;

/// Source of interactive answers.
pub trait Prompter: Send + Sync {
    /// Ask for a single line of input.
    ///
    /// `masked` marks answers that must not be echoed back or logged.
    fn input(&self, label: &str, masked: bool, validate: Validator) -> RemoteResult<String>;

    /// Ask the user to pick one of `choices`, returning its index.
    fn choose(&self, label: &str, choices: &[&str]) -> RemoteResult<usize>;
}

/// Authentication methods offered at the prompt.
pub const AUTH_METHODS: [&str; 2] = ["password", "private-key"];

/// Ask for user, auth method, then the matching secret, once each.
pub fn prompt_credential(prompter: &dyn Prompter, address: IpAddr) -> RemoteResult<Credential> {
    let user = prompter.input(
        &format!("Please enter SSH user for {address}"),
        false,
        validate_user,
    )?;
    let method = prompter.choose(
        "Which method do you want to use for SSH authentication?",
        &AUTH_METHODS,
    )?;
    match method {
        0 => {
            let password = prompter.input(
                &format!("Please enter SSH pass for {address}"),
                true,
                validate_non_empty,
            )?;
            Ok(Credential::password(user, password))
        }
        1 => {
            let path = prompter.input(
                &format!("Please enter SSH private key path for {address}"),
                false,
                validate_path,
            )?;
            Ok(Credential::private_key(user, path))
        }
        other => Err(RemoteError::prompt(format!("invalid choice {other}"))),
    }
}

/// Letters, digits, `_`, `.` and `-` only.
pub fn validate_user(input: &str) -> Result<(), String> {
    if input.is_empty() {
        return Err("need some input".to_owned());
    }
    if !input
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err("only use letters, numbers and dash".to_owned());
    }
    Ok(())
}

/// Anything but an empty string.
pub fn validate_non_empty(input: &str) -> Result<(), String> {
    if input.is_empty() {
        Err("need some input".to_owned())
    } else {
        Ok(())
    }
}

/// Absolute path without empty segments.
pub fn validate_path(input: &str) -> Result<(), String> {
    let path = Path::new(input);
    if input.is_empty() {
        return Err("need some input".to_owned());
    }
    if !path.is_absolute() || input.contains("//") || input.ends_with('/') {
        return Err("path is invalid".to_owned());
    }
    Ok(())
}

/// Prompter reading answers from standard input.
///
/// Masked answers are read from the terminal with echo turned off.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompter;

impl TerminalPrompter {
    fn read_line(label: &str) -> RemoteResult<String> {
        read_answer(
            &mut std::io::stdin().lock(),
            &mut std::io::stderr().lock(),
            label,
            false,
        )
    }

    fn read_masked(label: &str) -> RemoteResult<String> {
        Ok(rpassword::prompt_password(format!("{label}: "))?)
    }
}

/// Write the prompt for `label` to `writer` and read one answer from
/// `reader`. A masked answer is never written back.
fn read_answer(
    reader: &mut impl BufRead,
    writer: &mut impl Write,
    label: &str,
    masked: bool,
) -> RemoteResult<String> {
    if masked {
        return Ok(rpassword::prompt_password_from_bufread(
            reader,
            writer,
            format!("{label}: "),
        )?);
    }
    write!(writer, "{label}: ")?;
    writer.flush()?;

    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(RemoteError::prompt("standard input closed"));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_owned())
}

impl Prompter for TerminalPrompter {
    fn input(&self, label: &str, masked: bool, validate: Validator) -> RemoteResult<String> {
        loop {
            let answer = if masked {
                Self::read_masked(label)?
            } else {
                Self::read_line(label)?
            };
            match validate(&answer) {
                Ok(()) => return Ok(answer),
                Err(reason) => eprintln!("  {reason}"),
            }
        }
    }

    fn choose(&self, label: &str, choices: &[&str]) -> RemoteResult<usize> {
        if choices.is_empty() {
            return Err(RemoteError::prompt(format!("no choices for \"{label}\"")));
        }
        eprintln!("{label}");
        for (i, choice) in choices.iter().enumerate() {
            eprintln!("  {}) {choice}", i + 1);
        }
        loop {
            let answer = Self::read_line("Select")?;
            if let Some(index) = choices.iter().position(|c| *c == answer) {
                return Ok(index);
            }
            match answer.parse::<usize>() {
                Ok(n) if (1..=choices.len()).contains(&n) => return Ok(n - 1),
                _ => eprintln!("  enter a number between 1 and {}", choices.len()),
            }
        }
    }
}

/// Prompter that refuses every question.
#[derive(Debug, Default, Clone, Copy)]
pub struct NonInteractive;

impl Prompter for NonInteractive {
    fn input(&self, label: &str, _masked: bool, _validate: Validator) -> RemoteResult<String> {
        Err(RemoteError::prompt(format!(
            "interactive input disabled: {label}"
        )))
    }

    fn choose(&self, label: &str, _choices: &[&str]) -> RemoteResult<usize> {
        Err(RemoteError::prompt(format!(
            "interactive input disabled: {label}"
        )))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rstest::rstest;

    #[derive(Default)]
    struct Scripted {
        answers: Mutex<Vec<String>>,
        choice: usize,
        asked: Mutex<Vec<String>>,
    }

    impl Prompter for Scripted {
        fn input(&self, label: &str, _masked: bool, validate: Validator) -> RemoteResult<String> {
            self.asked.lock().push(label.to_owned());
            let answer = self.answers.lock().remove(0);
            validate(&answer).map_err(RemoteError::prompt)?;
            Ok(answer)
        }

        fn choose(&self, label: &str, _choices: &[&str]) -> RemoteResult<usize> {
            self.asked.lock().push(label.to_owned());
            Ok(self.choice)
        }
    }

    #[test]
    fn asks_user_method_then_password() {
        let prompter = Scripted {
            answers: Mutex::new(vec!["ops".into(), "pw".into()]),
            choice: 0,
            ..Default::default()
        };
        let cred = prompt_credential(&prompter, "10.0.0.1".parse().unwrap()).unwrap();
        assert_eq!(cred.user, "ops");
        assert_eq!(cred.password_str(), Some("pw"));

        let asked = prompter.asked.lock();
        assert_eq!(asked.len(), 3);
        assert!(asked[0].contains("user"));
        assert!(asked[1].contains("method"));
        assert!(asked[2].contains("pass"));
    }

    #[test]
    fn asks_for_key_path_when_private_key_chosen() {
        let prompter = Scripted {
            answers: Mutex::new(vec!["ops".into(), "/home/ops/.ssh/id_ed25519".into()]),
            choice: 1,
            ..Default::default()
        };
        let cred = prompt_credential(&prompter, "10.0.0.1".parse().unwrap()).unwrap();
        assert!(cred.password_str().is_none());
        assert!(prompter.asked.lock()[2].contains("private key"));
    }

    #[test]
    fn non_interactive_refuses() {
        let err = prompt_credential(&NonInteractive, "10.0.0.1".parse().unwrap()).unwrap_err();
        assert!(matches!(err, RemoteError::Prompt(_)));
    }

    #[test]
    fn masked_answer_is_not_written_back() {
        let mut input = std::io::Cursor::new(b"s3cr3t\n".to_vec());
        let mut shown = Vec::new();

        let answer = read_answer(&mut input, &mut shown, "Please enter SSH pass", true).unwrap();

        assert_eq!(answer, "s3cr3t");
        let shown = String::from_utf8(shown).unwrap();
        assert!(shown.contains("Please enter SSH pass: "));
        assert!(!shown.contains("s3cr3t"));
    }

    #[test]
    fn plain_answer_is_trimmed_and_eof_is_an_error() {
        let mut shown = Vec::new();
        let answer = read_answer(&mut &b"ops\r\n"[..], &mut shown, "user", false).unwrap();
        assert_eq!(answer, "ops");

        let err = read_answer(&mut &b""[..], &mut shown, "user", false).unwrap_err();
        assert!(matches!(err, RemoteError::Prompt(_)));
    }

    #[rstest]
    #[case("ops", true)]
    #[case("build.agent-01", true)]
    #[case("", false)]
    #[case("ops user", false)]
    #[case("root;rm", false)]
    fn user_validation(#[case] input: &str, #[case] ok: bool) {
        assert_eq!(validate_user(input).is_ok(), ok);
    }

    #[rstest]
    #[case("/home/ops/.ssh/id_rsa", true)]
    #[case("relative/key", false)]
    #[case("/home//key", false)]
    #[case("", false)]
    fn path_validation(#[case] input: &str, #[case] ok: bool) {
        assert_eq!(validate_path(input).is_ok(), ok);
    }
}
