use sner_core::models::Queue;

/// Test queue builder with sane defaults.
pub struct QueueBuilder {
    queue: Queue,
}

impl QueueBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            queue: Queue {
                id: 0,
                name: name.to_string(),
                config: "module: dummy\nargs: --arg1 abc --arg2\n".to_string(),
                group_size: 1,
                priority: 10,
                active: true,
                reqs: Vec::new(),
            },
        }
    }

    pub fn config(mut self, config: &str) -> Self {
        self.queue.config = config.to_string();
        self
    }

    pub fn group_size(mut self, group_size: i32) -> Self {
        self.queue.group_size = group_size;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.queue.priority = priority;
        self
    }

    pub fn active(mut self, active: bool) -> Self {
        self.queue.active = active;
        self
    }

    pub fn reqs(mut self, reqs: &[&str]) -> Self {
        self.queue.reqs = reqs.iter().map(|req| req.to_string()).collect();
        self
    }

    pub fn build(self) -> Queue {
        self.queue
    }
}
