//! An in-process communicator: one handle per worker thread, collectives
//! synchronised through a shared rendezvous.

use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex},
};

use crate::value::Value;

use super::{Communicator, DistributedError, WorkerDescriptor};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Kind {
    Concat,
    Sum,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Depositing,
    Collecting,
}

struct RoundState {
    phase: Phase,
    round: u64,
    deposits: Vec<Option<(Kind, Vec<f32>)>>,
    arrived: usize,
    departed: usize,
    result: Option<Vec<f32>>,
    failed: bool,
}

struct Shared {
    size: usize,
    state: Mutex<RoundState>,
    cv: Condvar,
    subgroups: Mutex<HashMap<Vec<usize>, Arc<Shared>>>,
}

impl Shared {
    fn new(size: usize) -> Self {
        Self {
            size,
            state: Mutex::new(RoundState {
                phase: Phase::Depositing,
                round: 0,
                deposits: vec![None; size],
                arrived: 0,
                departed: 0,
                result: None,
                failed: false,
            }),
            cv: Condvar::new(),
            subgroups: Mutex::new(HashMap::new()),
        }
    }
}

fn combine(kind: Kind, deposits: &[Option<(Kind, Vec<f32>)>]) -> Option<Vec<f32>> {
    let first_len = deposits[0].as_ref()?.1.len();

    for deposit in deposits {
        let (k, vals) = deposit.as_ref()?;
        if *k != kind || (kind == Kind::Sum && vals.len() != first_len) {
            return None;
        }
    }

    match kind {
        Kind::Concat => {
            let mut out = Vec::new();
            for deposit in deposits {
                out.extend_from_slice(&deposit.as_ref().unwrap().1);
            }
            Some(out)
        }
        Kind::Sum => {
            let mut out = vec![0.0; first_len];
            for deposit in deposits {
                for (o, &v) in out.iter_mut().zip(&deposit.as_ref().unwrap().1) {
                    *o += v;
                }
            }
            Some(out)
        }
    }
}

/// A worker's handle into an in-process group. Collectives block until all
/// members of the group arrive, then deliver the combined result to the
/// destination subset only.
pub struct LocalCommunicator {
    shared: Arc<Shared>,
    rank: usize,
    descriptor: WorkerDescriptor,
    members: Vec<WorkerDescriptor>,
}

impl LocalCommunicator {
    /// Creates a group of `size` workers, one handle per worker thread.
    pub fn group(size: usize) -> Vec<LocalCommunicator> {
        assert!(size > 0, "A communicator group needs at least one worker!");

        let shared = Arc::new(Shared::new(size));
        let members = (0..size)
            .map(|rank| WorkerDescriptor { global_rank: rank, host_id: "localhost".to_string() })
            .collect::<Vec<_>>();

        (0..size)
            .map(|rank| LocalCommunicator {
                shared: shared.clone(),
                rank,
                descriptor: members[rank].clone(),
                members: members.clone(),
            })
            .collect()
    }

    fn collective(&self, kind: Kind, payload: Vec<f32>, is_dest: bool) -> Result<Option<Vec<f32>>, DistributedError> {
        let shared = &*self.shared;
        let mut st = shared.state.lock().map_err(|_| DistributedError::Disconnected)?;

        // Wait out the tail of the previous round.
        while st.phase == Phase::Collecting {
            st = shared.cv.wait(st).map_err(|_| DistributedError::Disconnected)?;
        }

        let round = st.round;
        st.deposits[self.rank] = Some((kind, payload));
        st.arrived += 1;

        if st.arrived == shared.size {
            let combined = combine(kind, &st.deposits);
            st.failed = combined.is_none();
            st.result = combined;
            st.phase = Phase::Collecting;
            st.departed = 0;
            shared.cv.notify_all();
        } else {
            while !(st.phase == Phase::Collecting && st.round == round) {
                st = shared.cv.wait(st).map_err(|_| DistributedError::Disconnected)?;
            }
        }

        let failed = st.failed;
        let out = if failed || !is_dest { None } else { st.result.clone() };

        st.departed += 1;
        if st.departed == shared.size {
            st.phase = Phase::Depositing;
            st.round += 1;
            st.arrived = 0;
            st.deposits = vec![None; shared.size];
            st.result = None;
            st.failed = false;
            shared.cv.notify_all();
        }

        drop(st);

        if failed {
            Err(DistributedError::MismatchedContributions)
        } else {
            Ok(out)
        }
    }

    fn is_destination(&self, send_to: &[WorkerDescriptor]) -> bool {
        send_to.contains(&self.descriptor)
    }
}

impl Communicator for LocalCommunicator {
    fn workers(&self) -> Vec<WorkerDescriptor> {
        self.members.clone()
    }

    fn this_worker(&self) -> WorkerDescriptor {
        self.descriptor.clone()
    }

    fn sub_group(&self, workers: &[WorkerDescriptor]) -> Result<Box<dyn Communicator>, DistributedError> {
        let mut ranks = workers.iter().map(|w| w.global_rank).collect::<Vec<_>>();
        ranks.sort_unstable();
        ranks.dedup();

        let Some(sub_rank) = ranks.iter().position(|&r| r == self.descriptor.global_rank) else {
            return Err(DistributedError::NotAMember(self.descriptor.global_rank));
        };

        let shared = {
            let mut groups = self.shared.subgroups.lock().map_err(|_| DistributedError::Disconnected)?;
            groups.entry(ranks.clone()).or_insert_with(|| Arc::new(Shared::new(ranks.len()))).clone()
        };

        let members = ranks
            .iter()
            .map(|&r| WorkerDescriptor { global_rank: r, host_id: self.members[r].host_id.clone() })
            .collect::<Vec<_>>();

        Ok(Box::new(LocalCommunicator {
            shared,
            rank: sub_rank,
            descriptor: self.descriptor.clone(),
            members,
        }))
    }

    fn concatenate(
        &mut self,
        value: &Value,
        send_to: &[WorkerDescriptor],
    ) -> Result<Option<Value>, DistributedError> {
        let payload = value.dense()?.to_vec();
        let is_dest = self.is_destination(send_to);

        let Some(combined) = self.collective(Kind::Concat, payload, is_dest)? else {
            return Ok(None);
        };

        let len = combined.len();
        Ok(Some(Value::from_slice([len], None, &combined, value.device())?))
    }

    fn aggregate(
        &mut self,
        value: &Value,
        send_to: &[WorkerDescriptor],
    ) -> Result<Option<Value>, DistributedError> {
        let payload = value.dense()?.to_vec();
        let is_dest = self.is_destination(send_to);

        let Some(combined) = self.collective(Kind::Sum, payload, is_dest)? else {
            return Ok(None);
        };

        Ok(Some(Value::from_slice(
            value.shape().clone(),
            value.batch_size(),
            &combined,
            value.device(),
        )?))
    }

    fn quantized_aggregate(
        &mut self,
        value: &Value,
        residue: &mut Value,
        send_to: &[WorkerDescriptor],
    ) -> Result<Option<Value>, DistributedError> {
        let vals = value.dense()?;
        let res = residue.dense()?;

        // Error-corrected sign quantization: fold the previous residue in,
        // send two mean levels, carry the quantization error forward.
        let corrected = vals.iter().zip(res).map(|(&v, &r)| v + r).collect::<Vec<_>>();

        let (mut pos_sum, mut pos_count, mut neg_sum, mut neg_count) = (0.0f32, 0usize, 0.0f32, 0usize);
        for &v in &corrected {
            if v >= 0.0 {
                pos_sum += v;
                pos_count += 1;
            } else {
                neg_sum += v;
                neg_count += 1;
            }
        }

        let pos_level = if pos_count > 0 { pos_sum / pos_count as f32 } else { 0.0 };
        let neg_level = if neg_count > 0 { neg_sum / neg_count as f32 } else { 0.0 };

        let quantized = corrected
            .iter()
            .map(|&v| if v >= 0.0 { pos_level } else { neg_level })
            .collect::<Vec<_>>();

        {
            let res_buf = residue.dense_mut()?;
            for (r, (&c, &q)) in res_buf.iter_mut().zip(corrected.iter().zip(&quantized)) {
                *r = c - q;
            }
        }

        let is_dest = self.is_destination(send_to);
        let Some(combined) = self.collective(Kind::Sum, quantized, is_dest)? else {
            return Ok(None);
        };

        Ok(Some(Value::from_slice(
            value.shape().clone(),
            value.batch_size(),
            &combined,
            value.device(),
        )?))
    }
}
