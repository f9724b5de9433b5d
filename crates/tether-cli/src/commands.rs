//! Slash commands for interactive mode

use tether_wire::{Decision, PermissionDecision, PlanDecision};

/// A parsed slash command
#[derive(Debug, Clone, PartialEq)]
pub enum SlashCommand {
    Help,
    /// Abort the in-flight turn
    Abort,
    /// Answer the active prompt
    Decide(Decision),
    /// Start a fresh agent session
    Init,
    /// Leave the lost state and reconnect
    Retry,
    /// Refetch and print history
    History,
    /// Show connection and session state
    Status,
    Quit,
    /// Known command with bad arguments
    Usage(&'static str),
    Unknown(String),
}

/// Parse a slash command. Returns `None` for ordinary input.
pub fn parse(input: &str) -> Option<SlashCommand> {
    let input = input.trim();
    let rest = input.strip_prefix('/')?;

    let (command, args) = match rest.split_once(' ') {
        Some((command, args)) => (command, args.trim()),
        None => (rest, ""),
    };
    let feedback = (!args.is_empty()).then(|| args.to_string());

    Some(match command.to_lowercase().as_str() {
        "help" | "h" | "?" => SlashCommand::Help,
        "abort" | "stop" => SlashCommand::Abort,
        "allow" | "y" => SlashCommand::Decide(PermissionDecision::AllowOnce.into()),
        "always" => SlashCommand::Decide(PermissionDecision::AllowPermanently.into()),
        "deny" | "n" => SlashCommand::Decide(PermissionDecision::Deny.into()),
        "accept" => SlashCommand::Decide(PlanDecision::AutoAccept.into()),
        "review" => SlashCommand::Decide(PlanDecision::ReviewAccept.into()),
        "edit" if args.is_empty() => SlashCommand::Usage("/edit <revised plan>"),
        "edit" => SlashCommand::Decide(
            PlanDecision::EditPlan {
                edited_plan: args.to_string(),
                feedback: None,
            }
            .into(),
        ),
        "reject" => SlashCommand::Decide(PlanDecision::Reject { feedback }.into()),
        "init" => SlashCommand::Init,
        "retry" => SlashCommand::Retry,
        "history" => SlashCommand::History,
        "status" => SlashCommand::Status,
        "quit" | "exit" | "q" => SlashCommand::Quit,
        other => SlashCommand::Unknown(other.to_string()),
    })
}

pub fn help_message() -> String {
    r#"Available commands:
  /help, /h, /?         Show this help message
  /abort                Abort the running turn
  /allow, /y            Allow the pending tool call once
  /always               Always allow this tool
  /deny, /n             Deny the pending tool call
  /accept               Accept the proposed plan and continue automatically
  /review               Accept the plan, reviewing each step
  /edit <plan>          Replace the plan with your own
  /reject [feedback]    Reject the plan
  /init                 Start a fresh agent session
  /retry                Reconnect after the connection was lost
  /history              Reload and print the conversation
  /status               Show connection and session state
  /quit, /exit, /q      Exit tether"#
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_input_is_not_a_command() {
        assert_eq!(parse("hello there"), None);
        assert_eq!(parse(""), None);
    }

    #[test]
    fn test_permission_decisions() {
        assert_eq!(
            parse("/deny"),
            Some(SlashCommand::Decide(Decision::Permission(PermissionDecision::Deny)))
        );
        assert_eq!(
            parse("  /ALWAYS "),
            Some(SlashCommand::Decide(Decision::Permission(
                PermissionDecision::AllowPermanently
            )))
        );
    }

    #[test]
    fn test_plan_decisions_carry_arguments() {
        assert_eq!(
            parse("/edit 1. read 2. write"),
            Some(SlashCommand::Decide(Decision::Plan(PlanDecision::EditPlan {
                edited_plan: "1. read 2. write".into(),
                feedback: None,
            })))
        );
        assert_eq!(parse("/edit"), Some(SlashCommand::Usage("/edit <revised plan>")));
        assert_eq!(
            parse("/reject too risky"),
            Some(SlashCommand::Decide(Decision::Plan(PlanDecision::Reject {
                feedback: Some("too risky".into())
            })))
        );
        assert_eq!(
            parse("/reject"),
            Some(SlashCommand::Decide(Decision::Plan(PlanDecision::Reject {
                feedback: None
            })))
        );
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(parse("/frobnicate"), Some(SlashCommand::Unknown("frobnicate".into())));
        assert_eq!(parse("/q"), Some(SlashCommand::Quit));
    }
}
