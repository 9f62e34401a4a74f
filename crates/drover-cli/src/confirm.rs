use console::style;

use drover::agent::{ApprovalHandler, Decision, Mode, ModeCell};

/// Interactive confirmation gate for the terminal.
///
/// Mode switches write straight to the hierarchy's shared cell, so a
/// switch made while reviewing a subagent's command applies to every
/// agent in the tree.
pub struct ConsoleApproval {
    mode: ModeCell,
}

impl ConsoleApproval {
    pub fn new(mode: ModeCell) -> Self {
        Self { mode }
    }
}

impl ApprovalHandler for ConsoleApproval {
    fn review(&self, agent_id: &str, command: &str) -> Decision {
        println!(
            "\n{} proposes:\n{}",
            style(agent_id).cyan().bold(),
            style(command).yellow()
        );

        let choice = cliclack::select("Execute this command?")
            .item("run", "Run it", "")
            .item("reject", "Reject with a comment", "")
            .item("yolo", "Run it and switch to yolo mode", "stops asking, all agents")
            .item("human", "Reject and switch to human mode", "confirm everything, all agents")
            .interact();

        match choice {
            Ok("run") => Decision::Approve,
            Ok("yolo") => {
                self.mode.set(Mode::Yolo);
                Decision::Approve
            }
            Ok("human") => {
                self.mode.set(Mode::Human);
                Decision::Reject("Command not executed. Switching to human mode.".to_string())
            }
            Ok(_) => {
                let comment: String = cliclack::input("Comment for the agent")
                    .default_input("Command rejected by the user.")
                    .interact()
                    .unwrap_or_else(|_| "Command rejected by the user.".to_string());
                Decision::Reject(comment)
            }
            Err(_) => Decision::Interrupt,
        }
    }
}
