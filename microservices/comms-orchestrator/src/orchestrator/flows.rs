//! Per-purpose call flow definitions
//!
//! Each purpose declares its states, entry actions and transition table
//! as const data. The engine folds `(state, event)` into `(state,
//! actions)` using these tables; nothing here performs I/O.
//!
//! Phrase text below is the engineering fallback copy; localized
//! production scripts are owned by the campaign templates service and
//! substituted at deploy time.

use dastak_core::{Order, OrderState, Purpose};

/// Phrases the voice flows can speak
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phrase {
    Greeting,
    OrderDetails,
    AcceptRejectPrompt,
    PrepTimePrompt,
    AcceptedClose,
    RejectReasonPrompt,
    RejectedClose,
    InvalidRetry,
    ReminderPrompt,
    ReminderAckClose,
    AddressUpdatePrompt,
    AddressConfirmClose,
    TransferNotice,
    InboundGreeting,
    Goodbye,
    Apology,
}

impl Phrase {
    pub fn id(&self) -> &'static str {
        match self {
            Self::Greeting => "greeting",
            Self::OrderDetails => "order_details",
            Self::AcceptRejectPrompt => "accept_reject_prompt",
            Self::PrepTimePrompt => "prep_time_prompt",
            Self::AcceptedClose => "accepted_close",
            Self::RejectReasonPrompt => "reject_reason_prompt",
            Self::RejectedClose => "rejected_close",
            Self::InvalidRetry => "invalid_retry",
            Self::ReminderPrompt => "reminder_prompt",
            Self::ReminderAckClose => "reminder_ack_close",
            Self::AddressUpdatePrompt => "address_update_prompt",
            Self::AddressConfirmClose => "address_confirm_close",
            Self::TransferNotice => "transfer_notice",
            Self::InboundGreeting => "inbound_greeting",
            Self::Goodbye => "goodbye",
            Self::Apology => "apology",
        }
    }

    /// Whether the rendered text depends on the order. Per-order phrases
    /// get the order id folded into their cache key so repeat calls for
    /// the same order reuse the synthesis.
    pub fn per_order(&self) -> bool {
        matches!(self, Self::Greeting | Self::OrderDetails)
    }

    pub fn render(&self, order: Option<&Order>) -> String {
        match self {
            Self::Greeting => {
                let name = order
                    .map(|o| o.vendor.display_name.as_str())
                    .filter(|n| !n.is_empty())
                    .unwrap_or("partner");
                format!("Namaste {name}, this is the Dastak order desk calling.")
            }
            Self::OrderDetails => match order {
                Some(o) => {
                    let items = o
                        .items
                        .iter()
                        .map(|i| format!("{} {}", i.qty, i.name))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!(
                        "You have a new order number {} worth {} rupees: {items}.",
                        o.id,
                        o.amount_paise / 100
                    )
                }
                None => "You have a new order.".to_string(),
            },
            Self::AcceptRejectPrompt => {
                "Press 1 to accept this order, or press 2 to reject it.".to_string()
            }
            Self::PrepTimePrompt => {
                "How many minutes to prepare? Press 1 for fifteen, 2 for thirty, 3 for forty five."
                    .to_string()
            }
            Self::AcceptedClose => {
                "Thank you, the order is confirmed. Goodbye.".to_string()
            }
            Self::RejectReasonPrompt => {
                "Please say the reason for rejecting after the beep, then press hash.".to_string()
            }
            Self::RejectedClose => {
                "Understood, the order has been marked rejected. Goodbye.".to_string()
            }
            Self::InvalidRetry => "Sorry, that is not a valid choice. Let us try again.".to_string(),
            Self::ReminderPrompt => {
                "Your order is waiting. Press 1 if it is ready for pickup, or 2 for ten more minutes."
                    .to_string()
            }
            Self::ReminderAckClose => "Noted, thank you. Goodbye.".to_string(),
            Self::AddressUpdatePrompt => {
                "The delivery address for your current order has changed. Press 1 to confirm, or 2 to talk to support."
                    .to_string()
            }
            Self::AddressConfirmClose => {
                "Address update confirmed. Ride safe. Goodbye.".to_string()
            }
            Self::TransferNotice => "Connecting you to our support team now.".to_string(),
            Self::InboundGreeting => {
                "Namaste, welcome to Dastak. How can I help you today?".to_string()
            }
            Self::Goodbye => "Thank you for calling Dastak. Goodbye.".to_string(),
            Self::Apology => {
                "We are sorry, we are unable to continue this call right now. Please try again later."
                    .to_string()
            }
        }
    }
}

/// What a state listens for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Dtmf,
    Speech,
    OpenEnded,
}

/// Outcome a state reports, resolved to a `CallOutcome` at dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeSpec {
    AcceptedPrep(u32),
    Accepted,
    Rejected,
    Confirmed,
    NoAction,
    Extended(u32),
    Transferred,
    Completed,
}

/// One action executed on entering a state
#[derive(Debug, Clone, Copy)]
pub enum EntryOp {
    Say(Phrase),
    Prompt {
        phrase: Phrase,
        input: InputKind,
        timeout_secs: u64,
    },
    BeginRecording,
    EndRecording,
    Report(OutcomeSpec),
    RequestTransition(OrderState),
    AckEscalation,
    TransferOperator,
    Hangup,
}

#[derive(Debug, Clone, Copy)]
pub struct FlowState {
    pub id: &'static str,
    pub entry: &'static [EntryOp],
    /// Accepted digits and their targets
    pub on_digit: &'static [(char, &'static str)],
    /// Digit that ends an in-progress recording, and where to go
    pub terminator: Option<(char, &'static str)>,
    /// Where an out-of-set digit goes once the re-prompt budget is spent
    /// is `on_timeout`; before that, this state (if any) plays first
    pub invalid_to: Option<&'static str>,
    /// Re-prompts allowed before giving up on this state
    pub reprompt_budget: u8,
    pub on_timeout: Option<&'static str>,
    pub on_hangup: Option<&'static str>,
    /// Unconditional next state once entry actions finish
    pub auto_next: Option<&'static str>,
    pub terminal: bool,
}

const BASE: FlowState = FlowState {
    id: "",
    entry: &[],
    on_digit: &[],
    terminator: None,
    invalid_to: None,
    reprompt_budget: 0,
    on_timeout: None,
    on_hangup: None,
    auto_next: None,
    terminal: false,
};

#[derive(Debug)]
pub struct CallFlow {
    pub purpose: Purpose,
    pub entry: &'static str,
    /// Per-purpose recording flag; nothing hard-codes always-record
    pub recorded: bool,
    pub states: &'static [FlowState],
}

impl CallFlow {
    pub fn state(&self, id: &str) -> Option<&'static FlowState> {
        self.states.iter().find(|s| s.id == id)
    }

    pub fn for_purpose(purpose: Purpose) -> Option<&'static CallFlow> {
        match purpose {
            Purpose::VendorNewOrder => Some(&VENDOR_NEW_ORDER),
            Purpose::VendorReminder => Some(&VENDOR_REMINDER),
            Purpose::RiderAssign => Some(&RIDER_ASSIGN),
            Purpose::RiderAddressUpdate => Some(&RIDER_ADDRESS_UPDATE),
            Purpose::InboundCustomer => Some(&INBOUND_CUSTOMER),
            Purpose::CustomerStatus | Purpose::CustomerDelay => None,
        }
    }

    /// Phrases reachable within two transitions of the entry node, for
    /// pre-synthesis at call placement. The apology clip is always
    /// included so failure paths never leave the line silent.
    pub fn presynth_phrases(&self) -> Vec<Phrase> {
        let mut phrases: Vec<Phrase> = Vec::new();
        let mut frontier = vec![self.entry];
        for _depth in 0..=2 {
            let mut next = Vec::new();
            for id in frontier.drain(..) {
                let Some(state) = self.state(id) else { continue };
                for op in state.entry {
                    match op {
                        EntryOp::Say(p) | EntryOp::Prompt { phrase: p, .. } => {
                            if !phrases.contains(p) {
                                phrases.push(*p);
                            }
                        }
                        _ => {}
                    }
                }
                for (_, target) in state.on_digit {
                    next.push(*target);
                }
                for target in [
                    state.terminator.map(|(_, t)| t),
                    state.invalid_to,
                    state.on_timeout,
                    state.on_hangup,
                    state.auto_next,
                ]
                .into_iter()
                .flatten()
                {
                    next.push(target);
                }
            }
            frontier = next;
        }
        if !phrases.contains(&Phrase::Apology) {
            phrases.push(Phrase::Apology);
        }
        phrases
    }

    /// Every transition target must name a defined state.
    pub fn validate(&self) -> Result<(), String> {
        if self.state(self.entry).is_none() {
            return Err(format!("entry state {} missing", self.entry));
        }
        for state in self.states {
            let targets = state
                .on_digit
                .iter()
                .map(|(_, t)| *t)
                .chain(state.terminator.map(|(_, t)| t))
                .chain(state.invalid_to)
                .chain(state.on_timeout)
                .chain(state.on_hangup)
                .chain(state.auto_next);
            for target in targets {
                if self.state(target).is_none() {
                    return Err(format!("state {} references missing {target}", state.id));
                }
            }
        }
        Ok(())
    }
}

/// vendor.new_order: greeting -> accept/reject -> prep time or reason
pub static VENDOR_NEW_ORDER: CallFlow = CallFlow {
    purpose: Purpose::VendorNewOrder,
    entry: "greeting",
    recorded: true,
    states: &[
        FlowState {
            id: "greeting",
            entry: &[
                EntryOp::Say(Phrase::Greeting),
                EntryOp::Say(Phrase::OrderDetails),
                EntryOp::Prompt {
                    phrase: Phrase::AcceptRejectPrompt,
                    input: InputKind::Dtmf,
                    timeout_secs: 10,
                },
            ],
            on_digit: &[('1', "ack_accept"), ('2', "ack_reject_reason")],
            invalid_to: Some("invalid"),
            reprompt_budget: 1,
            on_timeout: Some("missed"),
            on_hangup: Some("missed"),
            ..BASE
        },
        FlowState {
            id: "invalid",
            entry: &[EntryOp::Say(Phrase::InvalidRetry)],
            auto_next: Some("greeting"),
            ..BASE
        },
        FlowState {
            id: "ack_accept",
            entry: &[EntryOp::Prompt {
                phrase: Phrase::PrepTimePrompt,
                input: InputKind::Dtmf,
                timeout_secs: 10,
            }],
            on_digit: &[('1', "set_15"), ('2', "set_30"), ('3', "set_45")],
            reprompt_budget: 1,
            on_timeout: Some("missed_time"),
            on_hangup: Some("missed_time"),
            ..BASE
        },
        FlowState {
            id: "set_15",
            entry: &[
                EntryOp::Report(OutcomeSpec::AcceptedPrep(15)),
                EntryOp::RequestTransition(OrderState::Processing),
                EntryOp::AckEscalation,
                EntryOp::Say(Phrase::AcceptedClose),
                EntryOp::Hangup,
            ],
            terminal: true,
            ..BASE
        },
        FlowState {
            id: "set_30",
            entry: &[
                EntryOp::Report(OutcomeSpec::AcceptedPrep(30)),
                EntryOp::RequestTransition(OrderState::Processing),
                EntryOp::AckEscalation,
                EntryOp::Say(Phrase::AcceptedClose),
                EntryOp::Hangup,
            ],
            terminal: true,
            ..BASE
        },
        FlowState {
            id: "set_45",
            entry: &[
                EntryOp::Report(OutcomeSpec::AcceptedPrep(45)),
                EntryOp::RequestTransition(OrderState::Processing),
                EntryOp::AckEscalation,
                EntryOp::Say(Phrase::AcceptedClose),
                EntryOp::Hangup,
            ],
            terminal: true,
            ..BASE
        },
        FlowState {
            id: "ack_reject_reason",
            entry: &[
                EntryOp::Prompt {
                    phrase: Phrase::RejectReasonPrompt,
                    input: InputKind::Speech,
                    timeout_secs: 30,
                },
                EntryOp::BeginRecording,
            ],
            terminator: Some(('#', "rejected")),
            on_timeout: Some("rejected"),
            on_hangup: Some("rejected"),
            ..BASE
        },
        FlowState {
            id: "rejected",
            entry: &[
                EntryOp::EndRecording,
                EntryOp::Report(OutcomeSpec::Rejected),
                EntryOp::AckEscalation,
                EntryOp::Say(Phrase::RejectedClose),
                EntryOp::Hangup,
            ],
            terminal: true,
            ..BASE
        },
        FlowState {
            id: "missed",
            entry: &[EntryOp::Report(OutcomeSpec::NoAction), EntryOp::Hangup],
            terminal: true,
            ..BASE
        },
        FlowState {
            id: "missed_time",
            entry: &[EntryOp::Report(OutcomeSpec::NoAction), EntryOp::Hangup],
            terminal: true,
            ..BASE
        },
    ],
};

/// rider.assign: accept or decline only
pub static RIDER_ASSIGN: CallFlow = CallFlow {
    purpose: Purpose::RiderAssign,
    entry: "greeting",
    recorded: false,
    states: &[
        FlowState {
            id: "greeting",
            entry: &[
                EntryOp::Say(Phrase::Greeting),
                EntryOp::Say(Phrase::OrderDetails),
                EntryOp::Prompt {
                    phrase: Phrase::AcceptRejectPrompt,
                    input: InputKind::Dtmf,
                    timeout_secs: 10,
                },
            ],
            on_digit: &[('1', "accepted"), ('2', "declined")],
            invalid_to: Some("invalid"),
            reprompt_budget: 1,
            on_timeout: Some("missed"),
            on_hangup: Some("missed"),
            ..BASE
        },
        FlowState {
            id: "invalid",
            entry: &[EntryOp::Say(Phrase::InvalidRetry)],
            auto_next: Some("greeting"),
            ..BASE
        },
        FlowState {
            id: "accepted",
            entry: &[
                EntryOp::Report(OutcomeSpec::Accepted),
                EntryOp::AckEscalation,
                EntryOp::Say(Phrase::AcceptedClose),
                EntryOp::Hangup,
            ],
            terminal: true,
            ..BASE
        },
        FlowState {
            id: "declined",
            entry: &[
                EntryOp::Report(OutcomeSpec::Rejected),
                EntryOp::AckEscalation,
                EntryOp::Say(Phrase::Goodbye),
                EntryOp::Hangup,
            ],
            terminal: true,
            ..BASE
        },
        FlowState {
            id: "missed",
            entry: &[EntryOp::Report(OutcomeSpec::NoAction), EntryOp::Hangup],
            terminal: true,
            ..BASE
        },
    ],
};

/// vendor.reminder: mark ready or extend ten minutes
pub static VENDOR_REMINDER: CallFlow = CallFlow {
    purpose: Purpose::VendorReminder,
    entry: "greeting",
    recorded: false,
    states: &[
        FlowState {
            id: "greeting",
            entry: &[EntryOp::Prompt {
                phrase: Phrase::ReminderPrompt,
                input: InputKind::Dtmf,
                timeout_secs: 10,
            }],
            on_digit: &[('1', "marked_ready"), ('2', "extended")],
            reprompt_budget: 1,
            on_timeout: Some("missed"),
            on_hangup: Some("missed"),
            ..BASE
        },
        FlowState {
            id: "marked_ready",
            entry: &[
                EntryOp::Report(OutcomeSpec::Confirmed),
                EntryOp::RequestTransition(OrderState::Handover),
                EntryOp::AckEscalation,
                EntryOp::Say(Phrase::ReminderAckClose),
                EntryOp::Hangup,
            ],
            terminal: true,
            ..BASE
        },
        FlowState {
            id: "extended",
            entry: &[
                EntryOp::Report(OutcomeSpec::Extended(10)),
                EntryOp::AckEscalation,
                EntryOp::Say(Phrase::ReminderAckClose),
                EntryOp::Hangup,
            ],
            terminal: true,
            ..BASE
        },
        FlowState {
            id: "missed",
            entry: &[EntryOp::Report(OutcomeSpec::NoAction), EntryOp::Hangup],
            terminal: true,
            ..BASE
        },
    ],
};

/// rider.address_update: confirm or escalate to support
pub static RIDER_ADDRESS_UPDATE: CallFlow = CallFlow {
    purpose: Purpose::RiderAddressUpdate,
    entry: "greeting",
    recorded: false,
    states: &[
        FlowState {
            id: "greeting",
            entry: &[EntryOp::Prompt {
                phrase: Phrase::AddressUpdatePrompt,
                input: InputKind::Dtmf,
                timeout_secs: 10,
            }],
            on_digit: &[('1', "confirmed"), ('2', "escalate")],
            reprompt_budget: 1,
            on_timeout: Some("missed"),
            on_hangup: Some("missed"),
            ..BASE
        },
        FlowState {
            id: "confirmed",
            entry: &[
                EntryOp::Report(OutcomeSpec::Confirmed),
                EntryOp::AckEscalation,
                EntryOp::Say(Phrase::AddressConfirmClose),
                EntryOp::Hangup,
            ],
            terminal: true,
            ..BASE
        },
        FlowState {
            id: "escalate",
            entry: &[
                EntryOp::Say(Phrase::TransferNotice),
                EntryOp::Report(OutcomeSpec::Transferred),
                EntryOp::TransferOperator,
            ],
            terminal: true,
            ..BASE
        },
        FlowState {
            id: "missed",
            entry: &[EntryOp::Report(OutcomeSpec::NoAction), EntryOp::Hangup],
            terminal: true,
            ..BASE
        },
    ],
};

/// customer.inbound: open-ended conversation with the language model
pub static INBOUND_CUSTOMER: CallFlow = CallFlow {
    purpose: Purpose::InboundCustomer,
    entry: "listening",
    recorded: true,
    states: &[
        FlowState {
            id: "listening",
            entry: &[EntryOp::Prompt {
                phrase: Phrase::InboundGreeting,
                input: InputKind::OpenEnded,
                timeout_secs: 15,
            }],
            on_timeout: Some("closing"),
            on_hangup: Some("ended"),
            ..BASE
        },
        FlowState {
            id: "closing",
            entry: &[
                EntryOp::Say(Phrase::Goodbye),
                EntryOp::Report(OutcomeSpec::Completed),
                EntryOp::Hangup,
            ],
            terminal: true,
            ..BASE
        },
        FlowState {
            id: "ended",
            entry: &[EntryOp::Report(OutcomeSpec::Completed)],
            terminal: true,
            ..BASE
        },
    ],
};
