//! channel.rs — primitive de canal et ordonnancement coopératif (C8, §4.8/§5).
//!
//! Les opérations `send`/`recv`/`close` vivent sur
//! [`lattice_core::value::ChannelData`] lui-même (la donnée doit être
//! atteignable directement depuis une `Value::Channel`) ; ce module ajoute
//! ce que le corpus n'a pas de précédent direct pour — `select` sur
//! plusieurs canaux à la fois — inspiré de la forme `ChannelData`
//! MPMC-partagée-par-Arc du dépôt `cem3`, adaptée au polling non bloquant
//! plutôt qu'à sa dépendance `may` (absente de la pile retenue ici).

use std::sync::Arc;
use std::time::Duration;

use lattice_core::value::{ChannelData, Value};

/// Un canal Lattice tel qu'exposé aux services runtime : une poignée
/// partagée vers les données de [`ChannelData`].
pub type Channel = Arc<ChannelData>;

/// Crée un canal, borné si `capacity` est `Some`.
pub fn new_channel(capacity: Option<usize>) -> Channel {
    ChannelData::new(capacity)
}

/// Intervalle de re-scrutation utilisé par [`select`] entre deux passes sur
/// l'ensemble des candidats.
const SELECT_POLL_INTERVAL: Duration = Duration::from_micros(200);

/// Un cas de `select` : soit une tentative de réception, soit une tentative
/// d'envoi (auquel cas `payload` donne la valeur à envoyer).
pub enum SelectCase<'a> {
    Recv(&'a Channel),
    Send(&'a Channel, Value),
}

/// Issue d'un `select` réussi : l'index du cas retenu et, pour un cas de
/// réception, la valeur obtenue.
pub struct SelectOutcome {
    pub index: usize,
    pub received: Option<Value>,
}

/// Sélectionne, parmi `cases`, le premier prêt (dans l'ordre où on les
/// découvre, pas nécessairement l'ordre de la liste — §4.8 ne garantit pas
/// de priorité). Bloque en ré-essayant à intervalle régulier jusqu'à ce
/// qu'un cas aboutisse ou que tous les canaux impliqués soient fermés et
/// vides, auquel cas renvoie `None`.
pub fn select(cases: &mut [SelectCase<'_>]) -> Option<SelectOutcome> {
    loop {
        let mut all_done = true;
        for (index, case) in cases.iter_mut().enumerate() {
            match case {
                SelectCase::Recv(chan) => {
                    if let Some(v) = chan.try_recv() {
                        return Some(SelectOutcome { index, received: Some(v) });
                    }
                    if !chan.is_closed() {
                        all_done = false;
                    }
                }
                SelectCase::Send(chan, value) => {
                    if chan.is_closed() {
                        continue;
                    }
                    all_done = false;
                    let pending = std::mem::replace(value, Value::Nil);
                    match chan.try_send(pending) {
                        Ok(()) => return Some(SelectOutcome { index, received: None }),
                        Err(lattice_core::value::TrySendError::Full) => {}
                        Err(lattice_core::value::TrySendError::Closed) => {}
                    }
                }
            }
        }
        if all_done {
            return None;
        }
        std::thread::sleep(SELECT_POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_then_recv_round_trips() {
        let chan = new_channel(None);
        chan.send(Value::Int(7)).unwrap();
        assert_eq!(chan.recv(), Some(Value::Int(7)));
    }

    #[test]
    fn closed_empty_channel_recv_returns_none() {
        let chan = new_channel(None);
        chan.close();
        assert_eq!(chan.recv(), None);
    }

    #[test]
    fn select_picks_whichever_recv_has_data() {
        let a = new_channel(None);
        let b = new_channel(None);
        b.send(Value::Int(1)).unwrap();

        let mut cases = [SelectCase::Recv(&a), SelectCase::Recv(&b)];
        let outcome = select(&mut cases).expect("b is ready");
        assert_eq!(outcome.index, 1);
        assert_eq!(outcome.received, Some(Value::Int(1)));
    }

    #[test]
    fn select_returns_none_when_all_channels_closed_and_empty() {
        let a = new_channel(None);
        a.close();
        let mut cases = [SelectCase::Recv(&a)];
        assert!(select(&mut cases).is_none());
    }
}
