//! NZB fixtures and content generators

/// Release with two rar files and one par2 set
pub const RAR_WITH_PARS_NZB: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE nzb PUBLIC "-//newzBin//DTD NZB 1.1//EN" "http://www.newzbin.com/DTD/nzb/nzb-1.1.dtd">
<nzb xmlns="http://www.newzbin.com/DTD/2003/nzb">
  <file poster="up@example.com" date="1600000000" subject="&quot;release.part01.rar&quot; yEnc (1/2)">
    <groups>
      <group>alt.binaries.test</group>
    </groups>
    <segments>
      <segment bytes="768000" number="1">rar1-seg1@example.com</segment>
      <segment bytes="768000" number="2">rar1-seg2@example.com</segment>
    </segments>
  </file>
  <file poster="up@example.com" date="1600000000" subject="&quot;release.part02.rar&quot; yEnc (1/1)">
    <groups>
      <group>alt.binaries.test</group>
    </groups>
    <segments>
      <segment bytes="768000" number="1">rar2-seg1@example.com</segment>
    </segments>
  </file>
  <file poster="up@example.com" date="1600000000" subject="&quot;release.vol00+01.PAR2&quot; yEnc (1/1)">
    <groups>
      <group>alt.binaries.test</group>
    </groups>
    <segments>
      <segment bytes="50000" number="1">par-seg1@example.com</segment>
    </segments>
  </file>
</nzb>"#;

/// Release whose every file is par2 parity
pub const PAR_ONLY_NZB: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<nzb xmlns="http://www.newzbin.com/DTD/2003/nzb">
  <file poster="up@example.com" date="1600000000" subject="&quot;release.vol00+01.par2&quot; yEnc (1/1)">
    <groups>
      <group>alt.binaries.test</group>
    </groups>
    <segments>
      <segment bytes="50000" number="1">par-only@example.com</segment>
    </segments>
  </file>
</nzb>"#;

/// Generate a release with `count` rar articles named `rar<i>@example.com`
pub fn nzb_with_rar_articles(count: usize) -> String {
    let mut segments = String::new();
    for i in 0..count {
        segments.push_str(&format!(
            "      <segment bytes=\"768000\" number=\"{}\">rar{i}@example.com</segment>\n",
            i + 1
        ));
    }
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<nzb xmlns="http://www.newzbin.com/DTD/2003/nzb">
  <file poster="up@example.com" date="1600000000" subject="&quot;release.part01.rar&quot; yEnc (1/{count})">
    <groups>
      <group>alt.binaries.test</group>
    </groups>
    <segments>
{segments}    </segments>
  </file>
</nzb>"#
    )
}
