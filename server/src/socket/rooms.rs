/// Socket.IO room names for the two room kinds the broker multiplexes.
pub fn workflow_room(workflow_id: &str) -> String {
    format!("workflow:{workflow_id}")
}

pub fn workspace_room(workspace_id: &str) -> String {
    format!("workspace:{workspace_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_names_are_namespaced() {
        assert_eq!(workflow_room("wf-1"), "workflow:wf-1");
        assert_eq!(workspace_room("ws-1"), "workspace:ws-1");
        assert_ne!(workflow_room("x"), workspace_room("x"));
    }
}
