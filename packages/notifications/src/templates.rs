//! Subject and body text per task status.

use crate::task::TaskStatus;

/// Notification text; `{title}` in the body is replaced by the task title.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Template {
    pub subject: &'static str,
    pub body: &'static str,
}

impl Template {
    pub fn render_body(&self, title: &str) -> String {
        self.body.replace("{title}", title)
    }
}

const TEMPLATES: &[(TaskStatus, Template)] = &[
    (
        TaskStatus::Pending,
        Template {
            subject: "New Task Created",
            body: "Task \"{title}\" was created and is pending.",
        },
    ),
    (
        TaskStatus::InProgress,
        Template {
            subject: "Task Started",
            body: "Task \"{title}\" is now in progress.",
        },
    ),
    (
        TaskStatus::Completed,
        Template {
            subject: "Task Completed",
            body: "Task \"{title}\" has been completed successfully.",
        },
    ),
    (
        TaskStatus::Cancelled,
        Template {
            subject: "Task Cancelled",
            body: "Task \"{title}\" has been cancelled.",
        },
    ),
];

const FALLBACK: Template = Template {
    subject: "Task Update",
    body: "Task \"{title}\" was updated.",
};

/// Look up the template for `status`, falling back to a generic update.
pub fn template_for(status: TaskStatus) -> &'static Template {
    TEMPLATES
        .iter()
        .find(|(s, _)| *s == status)
        .map(|(_, template)| template)
        .unwrap_or(&FALLBACK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_known_status_has_its_own_text() {
        let cases = [
            (TaskStatus::Pending, "New Task Created", "Task \"Ship\" was created and is pending."),
            (TaskStatus::InProgress, "Task Started", "Task \"Ship\" is now in progress."),
            (
                TaskStatus::Completed,
                "Task Completed",
                "Task \"Ship\" has been completed successfully.",
            ),
            (TaskStatus::Cancelled, "Task Cancelled", "Task \"Ship\" has been cancelled."),
        ];
        for (status, subject, body) in cases {
            let template = template_for(status);
            assert_eq!(template.subject, subject);
            assert_eq!(template.render_body("Ship"), body);
        }
    }

    #[test]
    fn unknown_status_falls_back_to_update() {
        let template = template_for(TaskStatus::Unknown);
        assert_eq!(template.subject, "Task Update");
        assert_eq!(template.render_body("Ship"), "Task \"Ship\" was updated.");
    }
}
