use std::collections::HashMap;

/// What the table knows about an incoming request number.
#[derive(Debug, PartialEq)]
pub enum RequestDisposition<'a, R> {
    /// Newer than anything seen from this client.
    Fresh,
    /// Equal to the latest executed request; the cached reply should be
    /// resent.
    Executed(&'a R),
    /// Equal to the latest request, which has not committed yet.
    InFlight,
    /// Older than the latest request.
    Stale,
}

/// Records for each client the number of its most recent request plus, once
/// that request has committed, the reply sent for it.
///
/// In-flight marks and executed replies are kept apart: log adoption during
/// a view change or state transfer discards the in-flight side and rebuilds
/// it from the new tail, while executed replies survive.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClientTable<R> {
    /// client_id -> most recent uncommitted request
    in_flight: HashMap<usize, usize>,
    /// client_id -> (most recent executed request, its reply)
    executed: HashMap<usize, (usize, R)>,
}

impl<R> ClientTable<R> {
    pub fn new() -> Self {
        Self {
            in_flight: HashMap::new(),
            executed: HashMap::new(),
        }
    }

    pub fn check(&self, client_id: usize, request_num: usize) -> RequestDisposition<'_, R> {
        if let Some((executed_num, reply)) = self.executed.get(&client_id) {
            match request_num.cmp(executed_num) {
                std::cmp::Ordering::Less => return RequestDisposition::Stale,
                std::cmp::Ordering::Equal => return RequestDisposition::Executed(reply),
                std::cmp::Ordering::Greater => {}
            }
        }
        if let Some(in_flight_num) = self.in_flight.get(&client_id) {
            match request_num.cmp(in_flight_num) {
                std::cmp::Ordering::Less => return RequestDisposition::Stale,
                std::cmp::Ordering::Equal => return RequestDisposition::InFlight,
                std::cmp::Ordering::Greater => {}
            }
        }
        RequestDisposition::Fresh
    }

    /// Record a request as in flight. Request numbers never move backwards.
    pub fn begin(&mut self, client_id: usize, request_num: usize) {
        let entry = self.in_flight.entry(client_id).or_insert(request_num);
        *entry = (*entry).max(request_num);
    }

    /// Cache the reply produced when a request committed and retire its
    /// in-flight mark.
    pub fn complete(&mut self, client_id: usize, request_num: usize, reply: R) {
        match self.executed.get(&client_id) {
            Some((executed_num, _)) if *executed_num > request_num => {}
            _ => {
                self.executed.insert(client_id, (request_num, reply));
            }
        }
        if self.in_flight.get(&client_id) == Some(&request_num) {
            self.in_flight.remove(&client_id);
        }
    }

    /// Forget every in-flight mark; adoption of a foreign log rebuilds them
    /// from its uncommitted tail.
    pub fn clear_in_flight(&mut self) {
        self.in_flight.clear();
    }

    pub fn in_flight(&self) -> &HashMap<usize, usize> {
        &self.in_flight
    }

    pub fn executed(&self) -> &HashMap<usize, (usize, R)> {
        &self.executed
    }
}
