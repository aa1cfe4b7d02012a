//! Reserved rendezvous ports for step launch. A configured port range
//! is shared by all steps; a port can be handed to a step only on
//! nodes where no other step holds it.

use crate::common::bitmap::Bitmap;

pub struct PortReservations {
    first: u16,
    last: u16,
    /// Per-port bitmap of nodes on which the port is taken.
    used: Vec<Bitmap>,
    node_count: usize,
}

impl PortReservations {
    pub fn new(first: u16, last: u16, node_count: usize) -> Self {
        let count = if last >= first {
            (last - first + 1) as usize
        } else {
            0
        };
        PortReservations {
            first,
            last,
            used: (0..count).map(|_| Bitmap::new(node_count)).collect(),
            node_count,
        }
    }

    pub fn port_count(&self) -> usize {
        self.used.len()
    }

    /// Reserve `count` ports free on every node of `node_bitmap`.
    /// Returns the ports and their ranged string form.
    pub fn alloc(
        &mut self,
        count: u16,
        node_bitmap: &Bitmap,
    ) -> crate::Result<(Vec<u16>, String)> {
        if count == 0 || count as usize > self.port_count() {
            return Err(crate::Error::InvalidPortCount);
        }
        let mut picked = Vec::with_capacity(count as usize);
        for (index, usage) in self.used.iter().enumerate() {
            if !usage.overlaps(node_bitmap) {
                picked.push(self.first + index as u16);
                if picked.len() == count as usize {
                    break;
                }
            }
        }
        if picked.len() < count as usize {
            log::info!(
                "insufficient free ports in {}-{} for {} node step",
                self.first,
                self.last,
                node_bitmap.count()
            );
            return Err(crate::Error::PortsBusy);
        }
        for port in &picked {
            self.used[(*port - self.first) as usize].union_with(node_bitmap);
        }
        Ok((picked.clone(), ranged_ports(&picked)))
    }

    /// Release a step's ports on its nodes.
    pub fn free(&mut self, ports: &[u16], node_bitmap: &Bitmap) {
        for port in ports {
            if *port < self.first || *port > self.last {
                continue;
            }
            self.used[(*port - self.first) as usize].subtract(node_bitmap);
        }
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }
}

fn ranged_ports(ports: &[u16]) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    let mut run: Option<(u16, u16)> = None;
    let flush = |out: &mut String, first: u16, last: u16| {
        if !out.is_empty() {
            out.push(',');
        }
        if first == last {
            let _ = write!(out, "{}", first);
        } else {
            let _ = write!(out, "{}-{}", first, last);
        }
    };
    for port in ports {
        match run {
            Some((first, last)) if *port == last + 1 => run = Some((first, *port)),
            Some((first, last)) => {
                flush(&mut out, first, last);
                run = Some((*port, *port));
            }
            None => run = Some((*port, *port)),
        }
    }
    if let Some((first, last)) = run {
        flush(&mut out, first, last);
    }
    out
}
