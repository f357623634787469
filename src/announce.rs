use crate::{
    chain::Address,
    participants::{ParticipantCounter, ParticipantList},
    protocol::{
        internal::{Communication, Executor, Round},
        InitializationError, Participant, Protocol, ProtocolError,
    },
};

const ROUND_ANNOUNCE: Round = 0;
const ROUNDS: usize = 1;

async fn do_announce(
    comms: Communication,
    members: Vec<Address>,
    participants: ParticipantList,
    me: Participant,
) -> Result<Vec<Participant>, ProtocolError> {
    let index = |p: Participant| u32::from(p) as usize;
    comms.send_many(ROUND_ANNOUNCE, &members[index(me)]).await;

    let mut seen = ParticipantCounter::new(&participants);
    seen.put(me);
    while !seen.full() {
        let (from, operator): (_, Address) = comms.recv(ROUND_ANNOUNCE).await?;
        // Unknown participants can't be indexed, so they are ignored first.
        if !participants.contains(from) {
            continue;
        }
        if members[index(from)] != operator {
            return Err(ProtocolError::AssertionFailed(format!(
                "participant {from} announced {operator}, expected {}",
                members[index(from)]
            )));
        }
        seen.put(from);
    }

    Ok((0..members.len() as u32).map(Participant::from).collect())
}

/// The presence announcement protocol.
///
/// Each member of a keep announces the operator it runs as, and waits until
/// it has heard every other member. A participant is identified by the
/// position of its operator in the keep's member list; the output is the
/// list of all participants, once every one of them has been confirmed.
pub fn announce(
    members: &[Address],
    operator: Address,
) -> Result<(Participant, impl Protocol<Output = Vec<Participant>> + Send), InitializationError> {
    let position = members.iter().position(|m| *m == operator).ok_or_else(|| {
        InitializationError::BadParameters(format!("{operator} is not a member"))
    })?;
    let me = Participant::from(position as u32);

    let all: Vec<Participant> = (0..members.len() as u32).map(Participant::from).collect();
    let participants = ParticipantList::new(&all).ok_or_else(|| {
        InitializationError::BadParameters("participant list cannot contain duplicates".to_string())
    })?;
    let mut unique = members.to_vec();
    unique.sort();
    unique.dedup();
    if unique.len() != members.len() {
        return Err(InitializationError::BadParameters(
            "member list cannot contain duplicates".to_string(),
        ));
    }

    let comms = Communication::new(ROUNDS, members.len());
    let fut = do_announce(comms.clone(), members.to_vec(), participants, me);
    Ok((me, Executor::new(comms, fut)))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::run_protocol;

    fn member(x: u8) -> Address {
        Address::from([x; 20])
    }

    #[test]
    fn test_announce() -> Result<(), ProtocolError> {
        let members = vec![member(3), member(1), member(2)];
        #[allow(clippy::type_complexity)]
        let mut protocols: Vec<(
            Participant,
            Box<dyn Protocol<Output = Vec<Participant>> + Send>,
        )> = Vec::new();
        for operator in &members {
            let (me, protocol) = announce(&members, *operator).unwrap();
            protocols.push((me, Box::new(protocol)));
        }

        let result = run_protocol(protocols)?;
        let expected: Vec<Participant> = (0u32..3).map(Participant::from).collect();
        assert!(result.iter().all(|(_, out)| *out == expected));
        Ok(())
    }

    #[test]
    fn test_announce_catches_impostor() {
        let members = vec![member(1), member(2)];
        let (_, mut honest) = announce(&members, member(1)).unwrap();
        // Participant 1 claims to be someone else.
        let (_, mut impostor) = announce(&[member(1), member(9)], member(9)).unwrap();

        let Ok(crate::protocol::Action::SendMany(claim)) = impostor.poke() else {
            panic!("expected an announcement");
        };
        assert!(matches!(
            honest.poke(),
            Ok(crate::protocol::Action::SendMany(_))
        ));
        honest.message(Participant::from(1u32), claim);
        assert!(honest.poke().is_err());
    }

    #[test]
    fn test_announce_requires_membership() {
        assert!(announce(&[member(1), member(2)], member(3)).is_err());
        assert!(announce(&[member(1), member(1)], member(1)).is_err());
    }
}
