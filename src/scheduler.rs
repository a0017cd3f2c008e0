use std::{
    cell::RefCell,
    rc::Rc,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use crate::{
    config::SchedulerConfig,
    delay_queue::{DelayQueue, TaskToken},
    error::Result,
    handler_set::{Condition, HandlerSet, Socket},
    poller::Poller,
    time::{Clock, DelayInterval},
    trigger::{indices, ClientData, EventTriggerId, TriggerHandle, TriggerTable},
};

/// Socket callback. Receives the subset of its registered conditions that
/// became ready.
pub type BackgroundHandler = Rc<RefCell<dyn FnMut(&mut TaskScheduler, Condition)>>;

/// Event trigger callback. Receives the data most recently recorded for the
/// trigger's slot.
pub type TriggerHandler = Rc<RefCell<dyn FnMut(&mut TaskScheduler, Option<ClientData>)>>;

/// A delayed task, run once and then dropped.
struct AlarmHandler(Box<dyn FnOnce(&mut TaskScheduler)>);

/// Single-threaded reactor: delayed tasks, socket handlers and event
/// triggers dispatched from one loop.
///
/// Nothing here is thread safe except the [`TriggerHandle`] returned by
/// [`TaskScheduler::trigger_handle`].
#[derive(Educe)]
#[educe(Debug)]
pub struct TaskScheduler {
    config: SchedulerConfig,
    delay_queue: DelayQueue<AlarmHandler>,
    handlers: HandlerSet<BackgroundHandler>,
    triggers: TriggerTable<TriggerHandler>,
    last_handled_socket: Option<Socket>,
    #[educe(Debug(ignore))]
    poller: Box<dyn Poller>,
    // reused between steps
    #[educe(Debug(ignore))]
    interests: Vec<(Socket, Condition)>,
    #[educe(Debug(ignore))]
    ready: Vec<(Socket, Condition)>,
}

#[cfg(unix)]
impl TaskScheduler {
    /// A scheduler over the OS poller and the system clock.
    pub fn new() -> Result<Self> {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Result<Self> {
        let poller = crate::poller::MioPoller::new(config.events_capacity)?;
        Ok(Self::from_parts(
            config,
            Box::new(poller),
            Box::new(crate::time::SystemClock),
        ))
    }
}

impl TaskScheduler {
    pub fn from_parts(config: SchedulerConfig, poller: Box<dyn Poller>, clock: Box<dyn Clock>) -> Self {
        let triggers = TriggerTable::new(poller.notifier());
        Self {
            config,
            delay_queue: DelayQueue::with_clock(clock),
            handlers: HandlerSet::new(),
            triggers,
            last_handled_socket: None,
            poller,
            interests: Vec::new(),
            ready: Vec::new(),
        }
    }

    /// Run `task` once, `microseconds` from now. Negative delays run as soon
    /// as possible.
    ///
    /// The returned token is only good for unscheduling.
    pub fn schedule_delayed_task<F>(&mut self, microseconds: i64, task: F) -> TaskToken
    where
        F: FnOnce(&mut TaskScheduler) + 'static,
    {
        let delay = DelayInterval::from_micros(microseconds);
        let token = self
            .delay_queue
            .add_entry(delay, AlarmHandler(Box::new(task)));
        tracing::trace!(?token, ?delay, "delayed task scheduled");
        token
    }

    /// Cancel a pending task and clear the caller's token. Stale tokens are
    /// ignored.
    pub fn unschedule_delayed_task(&mut self, token: &mut Option<TaskToken>) {
        let Some(token) = token.take() else {
            return;
        };
        if self.delay_queue.remove_entry(token).is_some() {
            tracing::trace!(?token, "delayed task unscheduled");
        }
    }

    /// Replace whatever `token` refers to with a new task.
    pub fn reschedule_delayed_task<F>(&mut self, token: &mut Option<TaskToken>, microseconds: i64, task: F)
    where
        F: FnOnce(&mut TaskScheduler) + 'static,
    {
        self.unschedule_delayed_task(token);
        *token = Some(self.schedule_delayed_task(microseconds, task));
    }

    /// Push back (or pull in) a pending task without replacing it.
    /// Returns false if the task already ran or was cancelled.
    pub fn update_delayed_task(&mut self, token: TaskToken, microseconds: i64) -> bool {
        self.delay_queue
            .update_entry(token, DelayInterval::from_micros(microseconds))
    }

    pub fn is_scheduled(&self, token: TaskToken) -> bool {
        self.delay_queue.contains(token)
    }

    pub fn pending_tasks(&self) -> usize {
        self.delay_queue.len()
    }

    pub fn time_to_next_alarm(&mut self) -> DelayInterval {
        self.delay_queue.time_to_next_alarm()
    }

    /// Watch `socket` for `conditions`. An empty condition set removes the
    /// socket's handler.
    pub fn set_background_handling<F>(&mut self, socket: Socket, conditions: Condition, handler: F)
    where
        F: FnMut(&mut TaskScheduler, Condition) + 'static,
    {
        if conditions.is_empty() {
            self.disable_background_handling(socket);
            return;
        }
        let handler: BackgroundHandler = Rc::new(RefCell::new(handler));
        self.handlers.assign_handler(socket, conditions, handler);
        tracing::debug!(socket, ?conditions, "background handling set");
    }

    pub fn turn_on_background_read_handling<F>(&mut self, socket: Socket, handler: F)
    where
        F: FnMut(&mut TaskScheduler, Condition) + 'static,
    {
        self.set_background_handling(socket, Condition::READABLE, handler);
    }

    pub fn disable_background_handling(&mut self, socket: Socket) {
        if self.handlers.clear_handler(socket).is_some() {
            tracing::debug!(socket, "background handling disabled");
        }
    }

    /// Carry a socket's handler over to a renumbered socket.
    pub fn move_socket_handling(&mut self, old: Socket, new: Socket) {
        if self.handlers.move_handler(old, new) {
            if self.last_handled_socket == Some(old) {
                self.last_handled_socket = Some(new);
            }
            tracing::debug!(old, new, "socket handling moved");
        }
    }

    pub fn handlers(&self) -> &HandlerSet<BackgroundHandler> {
        &self.handlers
    }

    /// Register a trigger handler. Returns `0` if all 32 slots are in use.
    pub fn create_event_trigger<F>(&mut self, handler: F) -> EventTriggerId
    where
        F: FnMut(&mut TaskScheduler, Option<ClientData>) + 'static,
    {
        let handler: TriggerHandler = Rc::new(RefCell::new(handler));
        self.triggers.create(handler)
    }

    pub fn delete_event_trigger(&mut self, id: EventTriggerId) {
        self.triggers.delete(id);
    }

    /// Signal a trigger from the reactor thread. Use [`Self::trigger_handle`]
    /// from other threads.
    pub fn trigger_event(&self, id: EventTriggerId, client_data: Option<ClientData>) {
        self.triggers.trigger_event(id, client_data);
    }

    pub fn trigger_handle(&self) -> TriggerHandle {
        self.triggers.handle()
    }

    /// Run the loop until `watch` is set. Returns early only if the platform
    /// layer fails.
    pub fn do_event_loop(&mut self, watch: Option<&AtomicBool>) -> Result<()> {
        loop {
            if watch.is_some_and(|flag| flag.load(Ordering::Acquire)) {
                return Ok(());
            }
            self.single_step(None)?;
        }
    }

    /// One loop iteration: wait for I/O or the next alarm, dispatch ready
    /// sockets, fire at most one due task, then service pending triggers.
    pub fn single_step(&mut self, max_delay: Option<Duration>) -> Result<()> {
        let mut timeout: Duration = self.delay_queue.time_to_next_alarm().into();
        timeout = timeout.min(self.config.max_poll_wait);
        if let Some(max_delay) = max_delay {
            timeout = timeout.min(max_delay);
        }
        if self.triggers.is_pending() {
            timeout = Duration::ZERO;
        }

        self.interests.clear();
        self.interests
            .extend(self.handlers.iter().map(|d| (d.socket, d.conditions)));

        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();
        if let Err(err) = self.poller.wait(&self.interests, timeout, &mut ready) {
            tracing::error!(%err, "platform wait failed");
            self.ready = ready;
            return Err(err.into());
        }

        self.dispatch_ready(&ready);
        self.ready = ready;

        if let Some((token, AlarmHandler(task))) = self.delay_queue.handle_alarm() {
            tracing::trace!(?token, "delayed task fired");
            task(self);
        }

        self.service_triggers();
        Ok(())
    }

    /// Call handlers for ready sockets, in handler-set order starting just
    /// after the socket handled last.
    fn dispatch_ready(&mut self, ready: &[(Socket, Condition)]) {
        if ready.is_empty() {
            return;
        }

        let order: Vec<Socket> = self.handlers.iter().map(|d| d.socket).collect();
        let start = self
            .last_handled_socket
            .and_then(|last| order.iter().position(|&socket| socket == last))
            .map_or(0, |position| position + 1);

        for &socket in order[start..].iter().chain(&order[..start]) {
            let Some(&(_, fired)) = ready.iter().find(|(s, _)| *s == socket) else {
                continue;
            };
            // an earlier handler in this step may have cleared or changed it
            let Some(descriptor) = self.handlers.lookup(socket) else {
                continue;
            };
            let conditions = fired & descriptor.conditions;
            if conditions.is_empty() {
                continue;
            }
            let handler = descriptor.handler.clone();

            self.last_handled_socket = Some(socket);
            match handler.try_borrow_mut() {
                Ok(mut handler) => (&mut *handler)(self, conditions),
                Err(_) => tracing::debug!(socket, "handler already running, skipped"),
            };
        }
    }

    fn service_triggers(&mut self) {
        let pending = self.triggers.awaiting();
        for index in indices(pending) {
            let Some(client_data) = self.triggers.claim(index) else {
                continue;
            };
            let Some(handler) = self.triggers.handler(index).cloned() else {
                tracing::trace!(index, "trigger fired with no handler");
                continue;
            };
            match handler.try_borrow_mut() {
                Ok(mut handler) => (&mut *handler)(self, client_data),
                Err(_) => tracing::debug!(index, "trigger handler already running, skipped"),
            };
        }
    }
}
